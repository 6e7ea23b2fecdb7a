//! Worker pool running request streams against the registry.
//!
//! Requests are spread round-robin over `num_of_channels` bounded lanes. Each lane
//! spawns workers lazily while none of its workers is idle, up to `num_of_threads`
//! in total. A worker owns a frame stack for nested calls and an arena of streams
//! that RT values point into.

use crate::error::*;
use crate::proto;
use crate::runtime::Runtime;
use crate::service::{ActionEntry, ArgDecoder, Registry};
use captains_log::LogFilter;
use crossfire::{MRx, MTx};
use rtrpc_core::{ServerConfig, Stream, StreamReceiver};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

const LANE_CAPACITY: usize = 1024;
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One invocation on a worker
pub(crate) struct Frame {
    pub lock: u64,
    pub level: usize,
    /// Index of the request stream in the arena
    pub src: usize,
    /// Arena length before this frame
    base: usize,
    pub entry: Arc<ActionEntry>,
    pub response: Option<Stream>,
}

pub(crate) struct WorkerState {
    pub frames: Vec<Frame>,
    lock_seed: u64,
    /// Index 0 is the scratch stream holding values set through RT containers
    pub streams: Vec<Stream>,
}

impl WorkerState {
    #[inline]
    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

pub(crate) struct Shared {
    registry: Registry,
    pub config: Arc<ServerConfig>,
    /// Receives responses and broadcasts
    pub out: Arc<dyn StreamReceiver>,
    running: AtomicBool,
    inflight: AtomicUsize,
    spawned: AtomicUsize,
    thread_seq: AtomicU64,
    pub logger: Arc<LogFilter>,
}

/// Per worker thread context shared with the Runtimes it hands out
pub(crate) struct WorkerCtx {
    thread_id: ThreadId,
    state: Mutex<WorkerState>,
    pub shared: Arc<Shared>,
}

impl WorkerCtx {
    fn new(shared: Arc<Shared>) -> Self {
        let state = WorkerState { frames: Vec::new(), lock_seed: 0, streams: vec![Stream::new()] };
        Self { thread_id: thread::current().id(), state: Mutex::new(state), shared }
    }

    #[inline(always)]
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    #[inline(always)]
    pub fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one request to completion on this thread and return its response.
    ///
    /// Nested calls re-enter here through `Runtime::call`.
    pub fn eval(self: &Arc<Self>, mut req: Stream) -> Stream {
        let shared = &self.shared;
        req.set_read_pos_to_body_start();
        let (target, from) = match (req.read_string(), req.read_string()) {
            (Ok(target), Ok(from)) => (target, from),
            _ => {
                let e = ERR_STREAM.msg("malformed request body");
                return proto::new_error_response(&req, &e);
            }
        };
        let level = req.get_depth() as usize + 1;
        if level > shared.config.max_call_depth {
            let e = ERR_CALL_OVERFLOW
                .msg(format!("call {} level({}) overflows", target, shared.config.max_call_depth));
            return proto::new_error_response(&req, &e);
        }
        let Some(entry) = shared.registry.get(&target).cloned() else {
            let e = ERR_ACTION_NOT_FOUND.msg(format!("target {} does not exist", target));
            return proto::new_error_response(&req, &e);
        };
        logger_trace!(shared.logger, "eval {} from {} level {}", target, from, level);
        let args_pos = req.get_read_pos();
        let mut reply_head = Stream::new();
        reply_head.copy_head_from(&req);
        let (lock, src, mut st) = {
            let mut st = self.lock();
            st.lock_seed += 1;
            let lock = st.lock_seed;
            let base = st.streams.len();
            st.streams.push(req);
            st.frames.push(Frame { lock, level, src: base, base, entry: entry.clone(), response: None });
            (lock, base, st)
        };
        let rt = Runtime::new(lock, self.clone());
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut d = ArgDecoder::new(st, src, rt.clone());
            entry.func.invoke(rt, &mut d)
        }));
        st = self.lock();
        let frame = loop {
            match st.frames.pop() {
                Some(frame) if frame.lock == lock => break Some(frame),
                Some(frame) => {
                    logger_error!(shared.logger, "{} left frame {} behind", entry.path, frame.lock);
                }
                None => break None,
            }
        };
        let resp = match frame {
            Some(frame) => {
                let resp = self.build_response(&mut st, src, &entry, result, args_pos, frame.response);
                st.streams.truncate(frame.base);
                resp
            }
            None => {
                let e = ERR_KERNEL_PANIC.msg(format!("frame of {} is lost", entry.path));
                logger_error!(shared.logger, "{}", e);
                proto::new_error_response(&reply_head, &e)
            }
        };
        if st.frames.is_empty() {
            st.streams.truncate(1);
            st.streams[0].reset();
        }
        resp
    }

    fn build_response(
        &self, st: &mut WorkerState, src: usize, entry: &ActionEntry,
        result: std::thread::Result<Option<crate::runtime::Return>>, args_pos: usize,
        response: Option<Stream>,
    ) -> Stream {
        let req = &mut st.streams[src];
        match result {
            Ok(Some(_)) => match response {
                Some(resp) => resp,
                None => {
                    let e = ERR_ACTION_NOT_REPLIED.msg(format!("{} returned without reply", entry.path));
                    logger_error!(self.shared.logger, "{}", e);
                    proto::new_error_response(req, &e)
                }
            },
            Ok(None) => {
                let e = ERR_ACTION_ARGUMENTS_MISMATCH.msg(format!(
                    "{} action arguments mismatch\nexpected: {}\ngot: {}({})",
                    entry.path,
                    entry.signature_string(),
                    entry.path,
                    scan_arg_types(req, args_pos).join(", ")
                ));
                proto::new_error_response(req, &e)
            }
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                logger_warn!(self.shared.logger, "{} panic: {}", entry.path, msg);
                let mut e = ERR_RUNTIME_PANIC.msg(msg);
                if req.get_status_bit_debug() || self.shared.config.debug {
                    let bt = std::backtrace::Backtrace::force_capture();
                    e = e.add_debug(format!("{}\n{}", entry.path, bt));
                }
                proto::new_error_response(req, &e)
            }
        }
    }
}

/// Type names of the values from `pos` to the end of the body
fn scan_arg_types(req: &mut Stream, pos: usize) -> Vec<&'static str> {
    let mut got = Vec::new();
    if !req.set_read_pos(pos) {
        return got;
    }
    while !req.is_read_finish() {
        match req.peek_type_name() {
            Some(name) => got.push(name),
            None => {
                got.push("<unknown>");
                break;
            }
        }
        if req.skip_value().is_err() {
            break;
        }
    }
    got
}

struct Lane {
    tx: MTx<Stream>,
    rx: MRx<Stream>,
    idle: Arc<AtomicUsize>,
}

/// Entry of request streams from sessions, see module doc
pub struct Processor {
    lanes: Vec<Lane>,
    next: AtomicUsize,
    shared: Arc<Shared>,
}

impl Processor {
    pub(crate) fn new(
        registry: Registry, config: Arc<ServerConfig>, out: Arc<dyn StreamReceiver>,
        logger: Arc<LogFilter>,
    ) -> Self {
        let mut lanes = Vec::with_capacity(config.num_of_channels);
        for _ in 0..config.num_of_channels.max(1) {
            let (tx, rx) = crossfire::mpmc::bounded_blocking::<Stream>(LANE_CAPACITY);
            lanes.push(Lane { tx, rx, idle: Arc::new(AtomicUsize::new(0)) });
        }
        let shared = Arc::new(Shared {
            registry,
            config,
            out,
            running: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            thread_seq: AtomicU64::new(0),
            logger,
        });
        Self { lanes, next: AtomicUsize::new(0), shared }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of requests accepted and not yet answered
    #[inline]
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.shared.spawned.load(Ordering::Acquire)
    }

    fn spawn_worker(&self, lane: &Lane) {
        let shared = &self.shared;
        if shared.spawned.fetch_add(1, Ordering::AcqRel) >= shared.config.num_of_threads {
            shared.spawned.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let seq = shared.thread_seq.fetch_add(1, Ordering::Relaxed);
        let rx = lane.rx.clone();
        let idle = lane.idle.clone();
        let _shared = shared.clone();
        let r = thread::Builder::new()
            .name(format!("rpc_worker_{}", seq))
            .spawn(move || worker_loop(_shared, rx, idle));
        if let Err(e) = r {
            shared.spawned.fetch_sub(1, Ordering::AcqRel);
            logger_error!(shared.logger, "spawn worker failed: {}", e);
        }
    }

    /// Stop taking requests, wait up to `timeout` for in-flight ones and for workers to exit
    pub fn close(&self, timeout: Duration) -> bool {
        self.shared.running.store(false, Ordering::Release);
        let deadline = Instant::now() + timeout;
        loop {
            if self.inflight() == 0 && self.workers() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                logger_warn!(
                    self.shared.logger,
                    "processor close timeout, inflight={} workers={}",
                    self.inflight(),
                    self.workers()
                );
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn reject(&self, req: &Stream) {
        let e = ERR_PROCESSOR_NOT_RUNNING.to_err();
        self.shared.out.on_receive_stream(proto::new_error_response(req, &e));
    }
}

impl StreamReceiver for Processor {
    fn on_receive_stream(&self, stream: Stream) {
        if !self.is_running() {
            self.reject(&stream);
            return;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        let lane = &self.lanes[i];
        if lane.idle.load(Ordering::Acquire) == 0 {
            self.spawn_worker(lane);
        }
        self.shared.inflight.fetch_add(1, Ordering::AcqRel);
        if lane.tx.send(stream).is_err() {
            self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            logger_warn!(self.shared.logger, "lane {} is closed, request dropped", i);
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

fn worker_loop(shared: Arc<Shared>, rx: MRx<Stream>, idle: Arc<AtomicUsize>) {
    let ctx = Arc::new(WorkerCtx::new(shared.clone()));
    logger_trace!(shared.logger, "worker {:?} start", ctx.thread_id);
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        let r = rx.recv_timeout(WORKER_POLL_INTERVAL);
        idle.fetch_sub(1, Ordering::AcqRel);
        match r {
            Ok(req) => {
                let resp = ctx.eval(req);
                shared.out.on_receive_stream(resp);
                shared.inflight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(_) => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
    logger_trace!(shared.logger, "worker {:?} exit", ctx.thread_id);
    shared.spawned.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::service::Service;
    use rtrpc_core::StreamKind;

    fn new_processor(svc: Service, max_call_depth: usize) -> (Processor, MRx<Stream>) {
        let mut config = ServerConfig::default();
        config.max_call_depth = max_call_depth;
        config.num_of_channels = 2;
        config.num_of_threads = 4;
        let registry = Registry::build(&[("test".to_string(), svc)], 128).expect("registry");
        let (tx, rx) = crossfire::mpmc::unbounded_blocking::<Stream>();
        let out = Arc::new(move |s: Stream| {
            let _ = tx.send(s);
        });
        (Processor::new(registry, Arc::new(config), out, Arc::new(LogFilter::new())), rx)
    }

    fn request(target: &str, args: &[rtrpc_core::Value], cb: u64) -> Stream {
        proto::new_request(target, proto::FROM_CLIENT, args, cb, 0).expect("req")
    }

    #[test]
    fn test_eval() {
        let svc = Service::new()
            .on("SayHello", |rt: Runtime, name: String| rt.reply(format!("hello {}", name)))
            .on("Panic", |_rt: Runtime| -> crate::runtime::Return { panic!("boom") });
        let (p, rx) = new_processor(svc, 8);
        p.on_receive_stream(request("#.test:SayHello", &["ts".into()], 1));
        let mut resp = rx.recv().expect("resp");
        assert_eq!(resp.kind(), Some(StreamKind::RpcResponseOk));
        assert_eq!(resp.get_callback_id(), 1);
        resp.set_read_pos_to_body_start();
        assert_eq!(resp.read_string().expect("str"), "hello ts");

        p.on_receive_stream(request("#.test:SayHello", &[3i64.into()], 2));
        let mut resp = rx.recv().expect("resp");
        assert_eq!(resp.kind(), Some(StreamKind::RpcResponseError));
        let e = proto::read_error(&mut resp).expect("err");
        assert!(e == ERR_ACTION_ARGUMENTS_MISMATCH);
        assert!(e.message().contains("expected: #.test:SayHello(rpc.String)"), "{}", e.message());
        assert!(e.message().contains("got: #.test:SayHello(rpc.Int64)"), "{}", e.message());

        p.on_receive_stream(request("#.test:Nothing", &[], 3));
        let e = proto::read_error(&mut rx.recv().expect("resp")).expect("err");
        assert!(e == ERR_ACTION_NOT_FOUND);

        p.on_receive_stream(request("#.test:Panic", &[], 4));
        let e = proto::read_error(&mut rx.recv().expect("resp")).expect("err");
        assert!(e == ERR_RUNTIME_PANIC);
        assert_eq!(e.message(), "boom");

        assert!(p.close(Duration::from_secs(2)));
        assert_eq!(p.workers(), 0);
        p.on_receive_stream(request("#.test:SayHello", &["ts".into()], 5));
        let e = proto::read_error(&mut rx.recv().expect("resp")).expect("err");
        assert!(e == ERR_PROCESSOR_NOT_RUNNING);
    }
}
