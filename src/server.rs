//! Server lifecycle: `open -> run -> close`, re-open after close is allowed.
//!
//! Each accepted connection gets a reader thread. The first stream must be an init,
//! which binds the connection to a new or resumed session; everything after that is
//! handed to the session.

use crate::conn::{StreamConn, StreamListener};
use crate::error::*;
use crate::processor::Processor;
use crate::proto;
use crate::service::{Registry, Service};
use crate::session::{Session, SessionManager};
use captains_log::LogFilter;
use crossfire::{MRx, MTx};
use rtrpc_core::stream::ControlCode;
use rtrpc_core::time::{TimeCache, now_ns};
use rtrpc_core::{ServerConfig, Stream, StreamHub, StreamKind, StreamReceiver};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const TIME_CACHE_INTERVAL: Duration = Duration::from_millis(10);

type BindFn = Box<dyn Fn() -> Result<Arc<dyn StreamListener>, RpcError> + Send + Sync>;

/// Routes processor output to the session named in the stream head
struct ReturnRouter {
    manager: OnceLock<Weak<SessionManager>>,
    logger: Arc<LogFilter>,
}

impl StreamReceiver for ReturnRouter {
    fn on_receive_stream(&self, stream: Stream) {
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            logger_debug!(self.logger, "drop {:?}, server is closed", stream);
            return;
        };
        let Some(session) = manager.get(stream.get_session_id()) else {
            logger_debug!(self.logger, "drop {:?}, session is gone", stream);
            return;
        };
        if stream.kind() == Some(StreamKind::RpcBroadcast) {
            session.on_broadcast(stream);
        } else {
            session.on_return_stream(stream);
        }
    }
}

/// State shared by the accept, reader and sweeper threads of one open
struct ServeCtx {
    config: Arc<ServerConfig>,
    manager: Arc<SessionManager>,
    running: AtomicBool,
    conn_seq: AtomicU64,
    conns: Mutex<FxHashMap<u64, Arc<dyn StreamConn>>>,
    /// Every reader thread holds a strong count until it exits
    conn_ref_count: Weak<()>,
    logger: Arc<LogFilter>,
}

impl ServeCtx {
    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn close_conns(&self) {
        let conns: Vec<Arc<dyn StreamConn>> = {
            let mut guard = self.conns.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            let _ = conn.close();
        }
    }

    fn report(&self, conn: &Arc<dyn StreamConn>, session_id: u64, callback_id: u64, err: &RpcError) {
        let mut s = proto::new_error_report(session_id, callback_id, err);
        s.build_stream_check();
        if let Err(e) = conn.write_stream(&s, self.config.write_timeout) {
            logger_debug!(self.logger, "lost report {} on {:?}: {}", err, conn, e);
        }
    }

    /// Read the init, bind the session and answer with init-back
    fn handshake(&self, conn: &Arc<dyn StreamConn>) -> Result<Arc<Session>, RpcError> {
        let mut s = conn.read_stream(self.config.read_timeout, self.config.transport_limit)?;
        if s.kind() != Some(StreamKind::ConnectRequest) || s.get_callback_id() != 0 {
            return Err(ERR_CONTROL_STREAM.msg(format!("expect init, got kind {}", s.get_kind())));
        }
        let (code, seq) = proto::read_control_head(&mut s)?;
        if code != ControlCode::Init {
            return Err(ERR_CONTROL_STREAM.msg(format!("expect init, got code {}", code as i64)));
        }
        let presented = s.read_string()?;
        let session = self.manager.get_or_create(&presented)?;
        if let Some((id, _)) = proto::parse_session(&presented) {
            if id != session.id() {
                let e = ERR_GATEWAY_SESSION_NOT_FOUND.msg(format!("session {} not found", id));
                logger_info!(self.logger, "{:?}: {}, assign {:?}", conn, e, session);
                self.report(conn, session.id(), 0, &e);
            }
        }
        session.attach(conn.clone());
        session.reply_init(conn, seq);
        Ok(session)
    }

    fn conn_loop(&self, id: u64, conn: Arc<dyn StreamConn>) {
        let session = match self.handshake(&conn) {
            Ok(session) => session,
            Err(e) => {
                logger_warn!(self.logger, "{:?} handshake failed: {}", conn, e);
                if e.kind() != ErrorKind::Transport {
                    self.report(&conn, 0, 0, &e);
                }
                let _ = conn.close();
                return;
            }
        };
        let failed = Arc::new(OnceLock::new());
        let hub = session_hub(&session, &failed);
        loop {
            match conn.read_stream(self.config.read_timeout, self.config.transport_limit) {
                Ok(stream) => {
                    let cb = stream.get_callback_id();
                    if let Err(e) = check_callback_id(&stream) {
                        logger_warn!(self.logger, "{:?} on {:?}: {}", session, conn, e);
                        session.report_error(&conn, cb, &e);
                        break;
                    }
                    hub.on_receive_stream(stream);
                    if let Some((cb, e)) = failed.get() {
                        logger_warn!(self.logger, "{:?} on {:?}: {}", session, conn, e);
                        session.report_error(&conn, *cb, e);
                        break;
                    }
                }
                Err(e) => {
                    if e.kind() == ErrorKind::Protocol {
                        logger_warn!(self.logger, "{:?} on {:?}: {}", session, conn, e);
                        session.report_error(&conn, 0, &e);
                    } else if self.is_running() {
                        logger_debug!(self.logger, "{:?} on {:?} read: {}", session, conn, e);
                    }
                    break;
                }
            }
        }
        let _ = conn.close();
        session.detach(&conn);
        self.conns.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

/// Callback id is 0 exactly on control kinds, a report may or may not name a callback
fn check_callback_id(stream: &Stream) -> Result<(), RpcError> {
    let cb = stream.get_callback_id();
    match stream.kind() {
        None => Err(ERR_STREAM.msg(format!("unknown stream kind {}", stream.get_kind()))),
        Some(StreamKind::SystemErrorReport) => Ok(()),
        Some(kind) if (cb == 0) == kind.is_data() => {
            Err(ERR_STREAM.msg(format!("{} stream with callback id {}", kind, cb)))
        }
        Some(_) => Ok(()),
    }
}

/// Feeds one side of a session from a connection's hub, the first failure ends the connection
#[derive(Clone)]
struct SessionPort {
    session: Arc<Session>,
    data: bool,
    failed: Arc<OnceLock<(u64, RpcError)>>,
}

impl StreamReceiver for SessionPort {
    fn on_receive_stream(&self, stream: Stream) {
        let cb = stream.get_callback_id();
        let r = if self.data {
            self.session.on_data_stream(stream)
        } else {
            self.session.on_control_stream(stream)
        };
        if let Err(e) = r {
            let _ = self.failed.set((cb, e));
        }
    }
}

/// Reports from the peer are only logged by the hub
fn session_hub(session: &Arc<Session>, failed: &Arc<OnceLock<(u64, RpcError)>>) -> StreamHub {
    let control = SessionPort { session: session.clone(), data: false, failed: failed.clone() };
    let data = SessionPort { data: true, ..control.clone() };
    StreamHub::new()
        .on(StreamKind::ConnectRequest, control.clone())
        .on(StreamKind::ConnectResponse, control.clone())
        .on(StreamKind::Ping, control.clone())
        .on(StreamKind::Pong, control)
        .on(StreamKind::RpcRequest, data.clone())
        .on(StreamKind::RpcResponseOk, data.clone())
        .on(StreamKind::RpcResponseError, data.clone())
        .on(StreamKind::RpcBroadcast, data)
}

struct Running {
    ctx: Arc<ServeCtx>,
    listeners: Vec<Arc<dyn StreamListener>>,
    processor: Arc<Processor>,
    threads: Vec<JoinHandle<()>>,
    done_tx: MTx<()>,
    done_rx: MRx<()>,
    _time_cache: TimeCache,
}

/// An RPC server serving a tree of services over any [StreamListener].
pub struct Server {
    config: Arc<ServerConfig>,
    services: Vec<(String, Service)>,
    binds: Vec<BindFn>,
    running: Mutex<Option<Running>>,
    conn_ref_count: Arc<()>,
    logger: Arc<LogFilter>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            services: Vec::new(),
            binds: Vec::new(),
            running: Mutex::new(None),
            conn_ref_count: Arc::new(()),
            logger: Arc::new(LogFilter::new()),
        }
    }

    #[inline]
    pub fn get_config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn logger(&self) -> &Arc<LogFilter> {
        &self.logger
    }

    /// Mount `service` as `#.{name}`
    pub fn add_service(&mut self, name: &str, service: Service) -> &mut Self {
        self.services.push((name.to_string(), service));
        self
    }

    /// Register a listener factory, called on every open
    pub fn listen<F>(&mut self, bind: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn StreamListener>, RpcError> + Send + Sync + 'static,
    {
        self.binds.push(Box::new(bind));
        self
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Validate the config, build the registry and bind every listener
    pub fn open(&self) -> Result<(), RpcError> {
        let mut guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(ERR_SERVER_ALREADY_RUNNING.to_err());
        }
        self.config.validate()?;
        let registry = Registry::build(&self.services, self.config.max_node_depth)?;
        logger_debug!(self.logger, "registered actions {:?}", registry.paths());
        let mut listeners = Vec::with_capacity(self.binds.len());
        for bind in &self.binds {
            match bind() {
                Ok(l) => {
                    logger_info!(self.logger, "listening on {}", l.local_addr());
                    listeners.push(l);
                }
                Err(e) => {
                    logger_error!(self.logger, "bind failed: {}", e);
                    for l in &listeners {
                        l.close();
                    }
                    return Err(e);
                }
            }
        }
        let router = Arc::new(ReturnRouter { manager: OnceLock::new(), logger: self.logger.clone() });
        let processor = Arc::new(Processor::new(
            registry,
            self.config.clone(),
            router.clone(),
            self.logger.clone(),
        ));
        let manager =
            Arc::new(SessionManager::new(self.config.clone(), processor.clone(), self.logger.clone()));
        let _ = router.manager.set(Arc::downgrade(&manager));
        let ctx = Arc::new(ServeCtx {
            config: self.config.clone(),
            manager,
            running: AtomicBool::new(true),
            conn_seq: AtomicU64::new(0),
            conns: Mutex::new(FxHashMap::default()),
            conn_ref_count: Arc::downgrade(&self.conn_ref_count),
            logger: self.logger.clone(),
        });
        let time_cache = TimeCache::start(TIME_CACHE_INTERVAL);
        let mut threads = Vec::new();
        for l in &listeners {
            let _ctx = ctx.clone();
            let _l = l.clone();
            let th = thread::Builder::new()
                .name("rpc_accept".to_string())
                .spawn(move || accept_loop(_ctx, _l))
                .map_err(|e| ERR_SERVER_NOT_RUNNING.msg(format!("spawn accept thread: {}", e)))?;
            threads.push(th);
        }
        let _ctx = ctx.clone();
        let th = thread::Builder::new()
            .name("rpc_session_sweep".to_string())
            .spawn(move || sweep_loop(_ctx))
            .map_err(|e| ERR_SERVER_NOT_RUNNING.msg(format!("spawn sweep thread: {}", e)))?;
        threads.push(th);
        let (done_tx, done_rx) = crossfire::mpmc::unbounded_blocking::<()>();
        *guard = Some(Running {
            ctx,
            listeners,
            processor,
            threads,
            done_tx,
            done_rx,
            _time_cache: time_cache,
        });
        logger_info!(self.logger, "server opened");
        Ok(())
    }

    /// Block until `close()` is called
    pub fn run(&self) -> Result<(), RpcError> {
        let done_rx = {
            let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(running) => running.done_rx.clone(),
                None => return Err(ERR_SERVER_NOT_RUNNING.to_err()),
            }
        };
        while done_rx.recv().is_ok() {}
        Ok(())
    }

    /// Addresses of the bound listeners
    pub fn local_addrs(&self) -> Vec<String> {
        let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(running) => running.listeners.iter().map(|l| l.local_addr()).collect(),
            None => Vec::new(),
        }
    }

    /// Number of live sessions
    pub fn sessions(&self) -> usize {
        let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|r| r.ctx.manager.len()).unwrap_or(0)
    }

    pub fn get_session(&self, id: u64) -> Option<Arc<Session>> {
        let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|r| r.ctx.manager.get(id))
    }

    /// Serve a connection accepted outside of the registered listeners
    pub fn serve_conn(&self, conn: Arc<dyn StreamConn>) -> Result<(), RpcError> {
        let ctx = {
            let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(running) => running.ctx.clone(),
                None => return Err(ERR_SERVER_NOT_RUNNING.to_err()),
            }
        };
        spawn_conn(ctx, conn);
        Ok(())
    }

    #[inline]
    fn get_alive_conn(&self) -> usize {
        Arc::strong_count(&self.conn_ref_count) - 1
    }

    /// Gracefully close the server
    ///
    /// Steps:
    /// - stop accepting and close the listeners
    /// - close every connection
    /// - wait for in-flight requests, bounded by `close_timeout`
    /// - wait for reader threads to exit, bounded by the same deadline
    pub fn close(&self) -> Result<(), RpcError> {
        let Some(running) = self.running.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Err(ERR_SERVER_NOT_RUNNING.to_err());
        };
        let deadline = Instant::now() + self.config.close_timeout;
        running.ctx.running.store(false, Ordering::Release);
        for l in &running.listeners {
            l.close();
            logger_info!(self.logger, "listener {} has closed", l.local_addr());
        }
        running.ctx.close_conns();
        running.processor.close(self.config.close_timeout);
        running.ctx.manager.close_all();
        let mut exists_count = self.get_alive_conn();
        while exists_count > 0 {
            if Instant::now() > deadline {
                logger_warn!(
                    self.logger,
                    "closed as wait too long for all conn closed voluntarily({} conn left)",
                    exists_count,
                );
                break;
            }
            thread::sleep(Duration::from_millis(10));
            exists_count = self.get_alive_conn();
        }
        for th in running.threads {
            let _ = th.join();
        }
        drop(running.done_tx);
        logger_info!(self.logger, "server closed with alive conn {}", exists_count);
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn spawn_conn(ctx: Arc<ServeCtx>, conn: Arc<dyn StreamConn>) {
    let id = ctx.conn_seq.fetch_add(1, Ordering::Relaxed);
    ctx.conns.lock().unwrap_or_else(|e| e.into_inner()).insert(id, conn.clone());
    let conn_count = ctx.conn_ref_count.upgrade();
    let _ctx = ctx.clone();
    let _conn = conn.clone();
    let r = thread::Builder::new().name(format!("rpc_conn_{}", id)).spawn(move || {
        _ctx.conn_loop(id, _conn);
        drop(conn_count);
    });
    if let Err(e) = r {
        logger_error!(ctx.logger, "spawn reader for {:?} failed: {}", conn, e);
        let _ = conn.close();
        ctx.conns.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

fn accept_loop(ctx: Arc<ServeCtx>, listener: Arc<dyn StreamListener>) {
    while ctx.is_running() {
        match listener.accept(ACCEPT_POLL_INTERVAL) {
            Ok(Some(conn)) => {
                logger_debug!(ctx.logger, "{} accept {:?}", listener.local_addr(), conn);
                spawn_conn(ctx.clone(), conn);
            }
            Ok(None) => {}
            Err(e) => {
                if !ctx.is_running() {
                    break;
                }
                logger_warn!(ctx.logger, "{} accept error: {}", listener.local_addr(), e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn sweep_loop(ctx: Arc<ServeCtx>) {
    let mut last = Instant::now();
    while ctx.is_running() {
        thread::sleep(ACCEPT_POLL_INTERVAL);
        if last.elapsed() >= SWEEP_INTERVAL {
            last = Instant::now();
            let evicted = ctx.manager.time_check(now_ns());
            if evicted > 0 {
                logger_debug!(ctx.logger, "sweep evicted {} sessions", evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::MemConn;

    #[test]
    fn test_lifecycle() {
        let mut config = ServerConfig::default();
        config.close_timeout = Duration::from_secs(1);
        let mut server = Server::new(config);
        server.add_service("test", Service::new());
        assert!(server.run().unwrap_err() == ERR_SERVER_NOT_RUNNING);
        assert!(server.close().unwrap_err() == ERR_SERVER_NOT_RUNNING);
        server.open().expect("open");
        assert!(server.open().unwrap_err() == ERR_SERVER_ALREADY_RUNNING);
        let (a, _b) = MemConn::pair();
        server.serve_conn(a.clone()).expect("serve");
        server.close().expect("close");
        assert!(a.is_closed());
        assert!(!server.is_running());
        server.open().expect("reopen");
        server.close().expect("close");
    }

    #[test]
    fn test_open_rejects_config() {
        let mut config = ServerConfig::default();
        config.session_concurrency = 0;
        let server = Server::new(config);
        assert!(server.open().unwrap_err() == ERR_CONFIG);
        assert!(!server.is_running());

        let mut server = Server::new(ServerConfig::default());
        server.add_service("bad.name", Service::new());
        assert!(server.open().unwrap_err() == ERR_SERVICE_NAME);
    }
}
