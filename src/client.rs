//! Blocking client.
//!
//! The client owns one session and keeps it across reconnects: after dialing again it
//! presents the session string, re-requests callback ids while marking the requests
//! still waiting, and retransmits them. The server answers a retransmit of a finished
//! request with its cached response, so every request runs at most once.

use crate::conn::StreamConn;
use crate::error::*;
use crate::proto;
use captains_log::LogFilter;
use crossfire::{MRx, MTx};
use rtrpc_core::stream::ControlCode;
use rtrpc_core::time::now_ns;
use rtrpc_core::{ClientConfig, LogSink, Stream, StreamHub, StreamKind, StreamReceiver, Value};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAINTAIN_INTERVAL: Duration = Duration::from_millis(50);
const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_TRANSPORT_LIMIT: usize = 4 * 1024 * 1024;

pub type DialFn = Box<dyn Fn() -> Result<Arc<dyn StreamConn>, RpcError> + Send + Sync>;

type BroadcastFn = Arc<dyn Fn(String, String, Value) + Send + Sync>;

type RespTx = MTx<Result<Stream, RpcError>>;

struct Pending {
    stream: Stream,
    tx: RespTx,
}

struct ClientState {
    conn: Option<Arc<dyn StreamConn>>,
    session: String,
    session_id: u64,
    ctrl_seq: u64,
    alloc_max: u64,
    free_ids: VecDeque<u64>,
    pending: FxHashMap<u64, Pending>,
    ids_requested: bool,
    concurrency: usize,
    transport_limit: usize,
}

impl ClientState {
    fn fail_pending(&mut self, e: &RpcError) {
        for (_, p) in self.pending.drain() {
            let _ = p.tx.send(Err(e.clone()));
        }
    }

    /// Build a request-ids claiming everything allocated so far, except what is pending
    fn new_request_ids(&mut self) -> Stream {
        self.ctrl_seq += 1;
        let mut s = proto::new_control(self.session_id, ControlCode::RequestIds, self.ctrl_seq);
        s.write_uint64(self.alloc_max);
        let mut marked: Vec<u64> = self.pending.keys().copied().collect();
        marked.sort_unstable();
        for id in marked {
            s.write_uint64(id);
        }
        s.build_stream_check();
        self.ids_requested = true;
        s
    }

    /// Ids above the previous max are ours, unused older ids were released by the request
    fn on_ids_back(&mut self, max: u64) {
        self.free_ids.clear();
        for id in self.alloc_max + 1..=max {
            self.free_ids.push_back(id);
        }
        if max > self.alloc_max {
            self.alloc_max = max;
        }
        self.ids_requested = false;
    }
}

struct ClientInner {
    config: ClientConfig,
    dial: DialFn,
    state: Mutex<ClientState>,
    cond: Condvar,
    running: AtomicBool,
    last_recv_ns: AtomicU64,
    last_ping_ns: AtomicU64,
    broadcast: Mutex<Option<BroadcastFn>>,
    log_sink: Mutex<Option<Arc<dyn LogSink>>>,
    logger: Arc<LogFilter>,
}

impl ClientInner {
    #[inline(always)]
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Read the next stream of `kind`, other streams are handed to `hub`
    fn read_until(
        &self, conn: &Arc<dyn StreamConn>, kind: StreamKind, limit: usize, hub: &StreamHub,
    ) -> Result<Stream, RpcError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ERR_TRANSPORT_TIMEOUT.msg("handshake timeout"));
            }
            let s = conn.read_stream(deadline - now, limit)?;
            if s.kind() == Some(kind) {
                return Ok(s);
            }
            hub.on_receive_stream(s);
        }
    }

    /// Init, then request ids, then retransmit pending requests
    fn handshake(self: &Arc<Self>, conn: &Arc<dyn StreamConn>) -> Result<(), RpcError> {
        let hub = self.new_hub();
        let (init, limit) = {
            let mut st = self.lock();
            st.ctrl_seq += 1;
            let mut s = proto::new_control(0, ControlCode::Init, st.ctrl_seq);
            s.write_string(&st.session);
            s.build_stream_check();
            (s, st.transport_limit)
        };
        conn.write_stream(&init, self.config.connect_timeout)?;
        let mut back = self.read_until(conn, StreamKind::ConnectResponse, limit, &hub)?;
        let (code, _seq) = proto::read_control_head(&mut back)?;
        if code != ControlCode::InitBack {
            return Err(ERR_CONTROL_STREAM.msg(format!("expect init-back, got {}", code)));
        }
        let params = proto::InitBack::read_from(&mut back)?;
        let Some((session_id, _)) = proto::parse_session(&params.session) else {
            return Err(ERR_CONTROL_STREAM.msg(format!("illegal session {}", params.session)));
        };
        let req_ids = {
            let mut st = self.lock();
            if !st.session.is_empty() && st.session_id != session_id {
                logger_warn!(
                    self.logger,
                    "session {} is gone, now {}, fail {} pending",
                    st.session,
                    params.session,
                    st.pending.len()
                );
                st.fail_pending(&ERR_GATEWAY_SESSION_NOT_FOUND.to_err());
                st.alloc_max = 0;
                st.free_ids.clear();
            }
            st.session = params.session.clone();
            st.session_id = session_id;
            st.concurrency = params.concurrency.max(1) as usize;
            if params.transport_limit > 0 {
                st.transport_limit = params.transport_limit as usize;
            }
            st.new_request_ids()
        };
        conn.write_stream(&req_ids, self.config.connect_timeout)?;
        let limit = self.lock().transport_limit;
        let mut back = self.read_until(conn, StreamKind::ConnectResponse, limit, &hub)?;
        let (code, _seq) = proto::read_control_head(&mut back)?;
        if code != ControlCode::RequestIdsBack {
            return Err(ERR_CONTROL_STREAM.msg(format!("expect request-ids-back, got {}", code)));
        }
        let max = back.read_uint64()?;
        let retransmit: Vec<Stream> = {
            let mut st = self.lock();
            st.on_ids_back(max);
            st.conn = Some(conn.clone());
            st.pending.values().map(|p| p.stream.clone()).collect()
        };
        self.cond.notify_all();
        self.last_recv_ns.store(now_ns(), Ordering::Release);
        logger_debug!(
            self.logger,
            "{:?} session {} ready, max id {}, retransmit {}",
            conn,
            params.session,
            max,
            retransmit.len()
        );
        for s in retransmit {
            conn.write_stream(&s, self.config.connect_timeout)?;
        }
        Ok(())
    }

    fn new_hub(self: &Arc<Self>) -> StreamHub {
        let mut hub = StreamHub::new();
        if let Some(sink) = self.log_sink.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            hub = hub.with_log_sink(sink);
        }
        let _self = self.clone();
        let on_response = move |s: Stream| _self.on_response(s);
        let _self = self.clone();
        let on_error_response = move |s: Stream| _self.on_response(s);
        let _self = self.clone();
        let on_control = move |s: Stream| _self.on_control_back(s);
        let _self = self.clone();
        let on_ping = move |_s: Stream| _self.send_keepalive(StreamKind::Pong);
        let _self = self.clone();
        let on_broadcast = move |s: Stream| _self.on_broadcast(s);
        let _self = self.clone();
        let on_report = move |s: Stream| _self.on_error_report(s);
        hub.on(StreamKind::RpcResponseOk, on_response)
            .on(StreamKind::RpcResponseError, on_error_response)
            .on(StreamKind::ConnectResponse, on_control)
            .on(StreamKind::Ping, on_ping)
            .on(StreamKind::RpcBroadcast, on_broadcast)
            .on(StreamKind::SystemErrorReport, on_report)
    }

    fn on_response(&self, s: Stream) {
        let cb = s.get_callback_id();
        let pending = self.lock().pending.remove(&cb);
        match pending {
            Some(p) => {
                let _ = p.tx.send(Ok(s));
                self.cond.notify_all();
            }
            None => logger_trace!(self.logger, "drop response {}, no one waiting", cb),
        }
    }

    fn on_control_back(&self, mut s: Stream) {
        let (code, seq) = match proto::read_control_head(&mut s) {
            Ok(head) => head,
            Err(e) => {
                logger_warn!(self.logger, "malformed control stream: {}", e);
                return;
            }
        };
        if code != ControlCode::RequestIdsBack {
            logger_warn!(self.logger, "unexpected control code {}", code);
            return;
        }
        let Ok(max) = s.read_uint64() else {
            logger_warn!(self.logger, "malformed request-ids-back");
            return;
        };
        {
            let mut st = self.lock();
            if seq != st.ctrl_seq {
                logger_debug!(self.logger, "drop stale request-ids-back {}", seq);
                return;
            }
            st.on_ids_back(max);
        }
        self.cond.notify_all();
    }

    fn on_broadcast(&self, mut s: Stream) {
        let (endpoint, topic, value) = match proto::read_broadcast(&mut s) {
            Ok(v) => v,
            Err(e) => {
                logger_warn!(self.logger, "malformed broadcast: {}", e);
                return;
            }
        };
        let f = self.broadcast.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match f {
            Some(f) => f(endpoint, topic, value),
            None => logger_trace!(self.logger, "drop broadcast {} {}", endpoint, topic),
        }
    }

    /// The report names the offending request, its caller gets the error
    fn on_error_report(&self, mut s: Stream) {
        let cb = s.get_callback_id();
        if cb == 0 {
            return;
        }
        let Ok(e) = proto::read_error(&mut s) else {
            return;
        };
        let pending = self.lock().pending.remove(&cb);
        if let Some(p) = pending {
            let _ = p.tx.send(Err(e));
            self.cond.notify_all();
        }
    }

    fn send_keepalive(&self, kind: StreamKind) {
        let (conn, session_id) = {
            let st = self.lock();
            (st.conn.clone(), st.session_id)
        };
        if let Some(conn) = conn {
            let mut s = proto::new_keepalive(kind, session_id);
            s.build_stream_check();
            if let Err(e) = conn.write_stream(&s, self.config.heartbeat) {
                logger_debug!(self.logger, "{:?} write {}: {}", conn, kind, e);
                let _ = conn.close();
            }
        }
    }

    /// Forget `conn` if it is still the current one
    fn drop_conn(&self, conn: &Arc<dyn StreamConn>) {
        let _ = conn.close();
        let mut st = self.lock();
        if let Some(cur) = st.conn.as_ref() {
            if Arc::as_ptr(cur) as *const () == Arc::as_ptr(conn) as *const () {
                st.conn = None;
                st.ids_requested = false;
                logger_debug!(self.logger, "{:?} dropped", conn);
            }
        }
        drop(st);
        self.cond.notify_all();
    }

    fn connect(self: &Arc<Self>) -> Result<Arc<dyn StreamConn>, RpcError> {
        let conn = (self.dial)()?;
        if let Err(e) = self.handshake(&conn) {
            let _ = conn.close();
            return Err(e);
        }
        Ok(conn)
    }
}

fn reader_loop(inner: Arc<ClientInner>, conn: Arc<dyn StreamConn>) {
    let hub = inner.new_hub();
    while inner.is_running() {
        let limit = inner.lock().transport_limit;
        match conn.read_stream(inner.config.heartbeat, limit) {
            Ok(s) => {
                inner.last_recv_ns.store(now_ns(), Ordering::Release);
                hub.on_receive_stream(s);
            }
            Err(e) => {
                if e == ERR_TRANSPORT_TIMEOUT {
                    continue;
                }
                if inner.is_running() {
                    logger_debug!(inner.logger, "{:?} read: {}", conn, e);
                }
                break;
            }
        }
    }
    inner.drop_conn(&conn);
}

fn maintain_loop(inner: Arc<ClientInner>) {
    let heartbeat = inner.config.heartbeat.as_nanos() as u64;
    let heartbeat_timeout = inner.config.heartbeat_timeout.as_nanos() as u64;
    let mut reader: Option<JoinHandle<()>> = None;
    while inner.is_running() {
        let conn = inner.lock().conn.clone();
        match conn {
            Some(conn) => {
                if reader.is_none() {
                    let _inner = inner.clone();
                    let _conn = conn.clone();
                    match thread::Builder::new()
                        .name("rpc_client_reader".to_string())
                        .spawn(move || reader_loop(_inner, _conn))
                    {
                        Ok(th) => reader = Some(th),
                        Err(e) => {
                            logger_error!(inner.logger, "spawn reader failed: {}", e);
                            inner.drop_conn(&conn);
                        }
                    }
                }
                let now = now_ns();
                if now.saturating_sub(inner.last_recv_ns.load(Ordering::Acquire)) > heartbeat_timeout {
                    logger_warn!(inner.logger, "{:?} heartbeat timeout", conn);
                    inner.drop_conn(&conn);
                } else if now.saturating_sub(inner.last_ping_ns.load(Ordering::Acquire)) >= heartbeat {
                    inner.last_ping_ns.store(now, Ordering::Release);
                    inner.send_keepalive(StreamKind::Ping);
                }
            }
            None => {
                if let Some(th) = reader.take() {
                    let _ = th.join();
                }
                match inner.connect() {
                    Ok(conn) => logger_info!(inner.logger, "reconnected {:?}", conn),
                    Err(e) => {
                        logger_debug!(inner.logger, "reconnect failed: {}", e);
                        thread::sleep(RECONNECT_INTERVAL);
                    }
                }
                continue;
            }
        }
        thread::sleep(MAINTAIN_INTERVAL);
    }
    if let Some(th) = reader.take() {
        let _ = th.join();
    }
}

/// A blocking client bound to one session
pub struct Client {
    inner: Arc<ClientInner>,
    maintain: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Dial, open or resume a session and start the background threads.
    ///
    /// `dial` is called again on every reconnect.
    pub fn connect<F>(config: ClientConfig, dial: F) -> Result<Self, RpcError>
    where
        F: Fn() -> Result<Arc<dyn StreamConn>, RpcError> + Send + Sync + 'static,
    {
        let inner = Arc::new(ClientInner {
            config,
            dial: Box::new(dial),
            state: Mutex::new(ClientState {
                conn: None,
                session: String::new(),
                session_id: 0,
                ctrl_seq: 0,
                alloc_max: 0,
                free_ids: VecDeque::new(),
                pending: FxHashMap::default(),
                ids_requested: false,
                concurrency: 1,
                transport_limit: DEFAULT_TRANSPORT_LIMIT,
            }),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            last_recv_ns: AtomicU64::new(now_ns()),
            last_ping_ns: AtomicU64::new(now_ns()),
            broadcast: Mutex::new(None),
            log_sink: Mutex::new(None),
            logger: Arc::new(LogFilter::new()),
        });
        inner.connect()?;
        let _inner = inner.clone();
        let th = thread::Builder::new()
            .name("rpc_client_maintain".to_string())
            .spawn(move || maintain_loop(_inner))
            .map_err(|e| ERR_TRANSPORT_CLOSED.msg(format!("spawn client thread: {}", e)))?;
        Ok(Self { inner, maintain: Mutex::new(Some(th)) })
    }

    #[inline]
    pub fn logger(&self) -> &Arc<LogFilter> {
        &self.inner.logger
    }

    /// `"{id}-{token}"` of the current session
    pub fn session(&self) -> String {
        self.inner.lock().session.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().conn.is_some()
    }

    /// Called with (endpoint, topic, payload) for every broadcast
    pub fn on_broadcast<F: Fn(String, String, Value) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.broadcast.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(f));
    }

    /// Where system error reports are written, takes effect on the next connection
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self.inner.log_sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Drop the current connection, the session is resumed on reconnect
    pub fn disconnect(&self) {
        let conn = self.inner.lock().conn.clone();
        if let Some(conn) = conn {
            self.inner.drop_conn(&conn);
        }
    }

    #[inline]
    pub fn send(&self, target: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.send_timeout(target, args, self.inner.config.request_timeout)
    }

    pub fn send_timeout(
        &self, target: &str, args: &[Value], timeout: Duration,
    ) -> Result<Value, RpcError> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let mut req = proto::new_request(target, proto::FROM_CLIENT, args, 0, 0)?;
        req.set_status_bit_debug(inner.config.debug);
        let (tx, rx): (RespTx, MRx<Result<Stream, RpcError>>) =
            crossfire::mpmc::bounded_blocking(1);
        let mut st = inner.lock();
        let id = loop {
            if !inner.is_running() {
                return Err(ERR_TRANSPORT_CLOSED.msg("client is closed"));
            }
            if let Some(id) = st.free_ids.pop_front() {
                break id;
            }
            if !st.ids_requested && st.pending.len() < st.concurrency {
                if let Some(conn) = st.conn.clone() {
                    let s = st.new_request_ids();
                    if let Err(e) = conn.write_stream(&s, inner.config.heartbeat) {
                        logger_debug!(inner.logger, "{:?} request ids: {}", conn, e);
                        st.ids_requested = false;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ERR_TRANSPORT_TIMEOUT.msg(format!("no callback id for {}", target)));
            }
            let wait = std::cmp::min(deadline - now, MAINTAIN_INTERVAL * 4);
            st = inner.cond.wait_timeout(st, wait).map(|(g, _)| g).unwrap_or_else(|e| e.into_inner().0);
        };
        req.set_callback_id(id);
        req.set_session_id(st.session_id);
        req.build_stream_check();
        let conn = st.conn.clone();
        st.pending.insert(id, Pending { stream: req.clone(), tx });
        drop(st);
        logger_trace!(inner.logger, "send {} with id {}", target, id);
        if let Some(conn) = conn {
            if let Err(e) = conn.write_stream(&req, inner.config.heartbeat) {
                // resent after reconnect
                logger_debug!(inner.logger, "{:?} write {}: {}", conn, id, e);
                inner.drop_conn(&conn);
            }
        }
        let now = Instant::now();
        let r = if now < deadline { rx.recv_timeout(deadline - now).ok() } else { None };
        let Some(r) = r else {
            inner.lock().pending.remove(&id);
            return Err(ERR_TRANSPORT_TIMEOUT.msg(format!("{} timeout", target)));
        };
        let mut resp = r?;
        match resp.kind() {
            Some(StreamKind::RpcResponseOk) => {
                resp.set_read_pos_to_body_start();
                Ok(resp.read()?)
            }
            _ => Err(proto::read_error(&mut resp)?),
        }
    }

    /// Stop the background threads and fail every waiting request
    pub fn close(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let conn = {
            let mut st = inner.lock();
            st.fail_pending(&ERR_TRANSPORT_CLOSED.msg("client is closed"));
            st.conn.take()
        };
        if let Some(conn) = conn {
            let _ = conn.close();
        }
        inner.cond.notify_all();
        let th = self.maintain.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(th) = th {
            let _ = th.join();
        }
        logger_info!(inner.logger, "client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
