//! Sessions and their callback slots.
//!
//! A [Session] outlives connections: a client that reconnects and presents the same
//! `"{id}-{token}"` gets its slots and cached responses back.

use crate::conn::StreamConn;
use crate::error::*;
use crate::proto;
use captains_log::LogFilter;
use rtrpc_core::stream::ControlCode;
use rtrpc_core::time::now_ns;
use rtrpc_core::{ServerConfig, Stream, StreamKind, StreamReceiver};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

mod manager;
pub use manager::SessionManager;
mod record;
pub use record::{RecordStatus, SessionRecord};

struct SessionInner {
    conn: Option<Arc<dyn StreamConn>>,
    data_seq: u64,
    ctrl_seq: u64,
    slot_map: FxHashMap<u64, Arc<SessionRecord>>,
}

pub struct Session {
    id: u64,
    token: String,
    inner: Mutex<SessionInner>,
    active_ns: AtomicU64,
    unknown_marks: AtomicU64,
    config: Arc<ServerConfig>,
    processor: Arc<dyn StreamReceiver>,
    logger: Arc<LogFilter>,
}

#[inline(always)]
fn same_conn(a: &Arc<dyn StreamConn>, b: &Arc<dyn StreamConn>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Session {
    pub(crate) fn new(
        id: u64, token: String, config: Arc<ServerConfig>, processor: Arc<dyn StreamReceiver>,
        logger: Arc<LogFilter>,
    ) -> Self {
        Self {
            id,
            token,
            inner: Mutex::new(SessionInner {
                conn: None,
                data_seq: 0,
                ctrl_seq: 0,
                slot_map: FxHashMap::default(),
            }),
            active_ns: AtomicU64::new(now_ns()),
            unknown_marks: AtomicU64::new(0),
            config,
            processor,
            logger,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[inline]
    pub fn session_string(&self) -> String {
        proto::format_session(self.id, &self.token)
    }

    #[inline(always)]
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn touch(&self) {
        self.active_ns.store(now_ns(), Ordering::Release);
    }

    #[inline]
    pub fn is_timeout(&self, now: u64) -> bool {
        let active = self.active_ns.load(Ordering::Acquire);
        now.saturating_sub(active) > self.config.session_timeout.as_nanos() as u64
    }

    /// Number of marks received for ids that had no slot
    #[inline]
    pub fn unknown_marks(&self) -> u64 {
        self.unknown_marks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.lock().conn.is_some()
    }

    /// Bind a connection, a previous one is closed
    pub fn attach(&self, conn: Arc<dyn StreamConn>) {
        self.touch();
        let old = {
            let mut inner = self.lock();
            inner.conn.replace(conn.clone())
        };
        if let Some(old) = old {
            if !same_conn(&old, &conn) {
                logger_debug!(self.logger, "{:?} replace {:?} with {:?}", self, old, conn);
                let _ = old.close();
            }
        } else {
            logger_debug!(self.logger, "{:?} attach {:?}", self, conn);
        }
    }

    /// Unbind only if `conn` is still the attached one
    pub fn detach(&self, conn: &Arc<dyn StreamConn>) -> bool {
        let mut inner = self.lock();
        if let Some(cur) = inner.conn.as_ref() {
            if same_conn(cur, conn) {
                inner.conn = None;
                logger_debug!(self.logger, "{:?} detach {:?}", self, conn);
                return true;
            }
        }
        false
    }

    /// Detach and close whatever connection is bound
    pub fn close_conn(&self) {
        let conn = self.lock().conn.take();
        if let Some(conn) = conn {
            let _ = conn.close();
        }
    }

    #[inline]
    fn get_conn(&self) -> Option<Arc<dyn StreamConn>> {
        self.lock().conn.clone()
    }

    /// Write on a connection, a failed connection is closed and detached
    fn write_to(&self, conn: &Arc<dyn StreamConn>, stream: &Stream) -> bool {
        match conn.write_stream(stream, self.config.write_timeout) {
            Ok(()) => true,
            Err(e) => {
                logger_warn!(self.logger, "{:?} write {:?} on {:?} failed: {}", self, stream, conn, e);
                let _ = conn.close();
                self.detach(conn);
                false
            }
        }
    }

    /// Answer an init on `conn` with the session parameters
    pub fn reply_init(&self, conn: &Arc<dyn StreamConn>, seq: u64) -> bool {
        let mut s = proto::new_control(self.id, ControlCode::InitBack, seq);
        proto::InitBack {
            session: self.session_string(),
            read_timeout_ms: self.config.read_timeout.as_millis() as i64,
            write_timeout_ms: self.config.write_timeout.as_millis() as i64,
            transport_limit: self.config.transport_limit as i64,
            concurrency: self.config.session_concurrency as i64,
        }
        .write_to(&mut s);
        s.build_stream_check();
        self.write_to(conn, &s)
    }

    /// Handle a stream with callback id 0.
    ///
    /// Errors are protocol errors, the caller should report and close the connection.
    pub fn on_control_stream(&self, mut stream: Stream) -> Result<(), RpcError> {
        self.touch();
        match stream.kind() {
            Some(StreamKind::Ping) => {
                if let Some(conn) = self.get_conn() {
                    let mut pong = proto::new_keepalive(StreamKind::Pong, self.id);
                    pong.build_stream_check();
                    self.write_to(&conn, &pong);
                }
                return Ok(());
            }
            Some(StreamKind::Pong) => return Ok(()),
            Some(StreamKind::ConnectRequest) => {}
            _ => {
                return Err(ERR_CONTROL_STREAM
                    .msg(format!("unexpected control stream kind {}", stream.get_kind())));
            }
        }
        let (code, seq) = proto::read_control_head(&mut stream)?;
        match code {
            ControlCode::RequestIds => {
                let current = stream.read_uint64()?;
                let mut marked = Vec::new();
                while !stream.is_read_finish() {
                    marked.push(stream.read_uint64()?);
                }
                let max = self.request_ids(seq, current, &marked);
                if let Some(conn) = self.get_conn() {
                    let mut back = proto::new_control(self.id, ControlCode::RequestIdsBack, seq);
                    back.write_uint64(max);
                    back.build_stream_check();
                    self.write_to(&conn, &back);
                }
                Ok(())
            }
            _ => Err(ERR_CONTROL_STREAM.msg(format!("unexpected control code {}", code))),
        }
    }

    /// Mark, sweep and refill the slot map, returns the highest allocated id.
    ///
    /// A sequence not above the last one is a retransmit: nothing changes and the
    /// current max is acknowledged again.
    pub fn request_ids(&self, seq: u64, current: u64, marked: &[u64]) -> u64 {
        let mut inner = self.lock();
        if seq <= inner.ctrl_seq {
            logger_trace!(self.logger, "{:?} stale request-ids seq={}", self, seq);
            return inner.data_seq;
        }
        inner.ctrl_seq = seq;
        for id in marked {
            match inner.slot_map.get(id) {
                Some(record) => record.set_mark(),
                None => {
                    self.unknown_marks.fetch_add(1, Ordering::Relaxed);
                    logger_debug!(self.logger, "{:?} mark unknown id {}", self, id);
                }
            }
        }
        inner.slot_map.retain(|id, record| {
            let marked = record.take_mark();
            *id > current || marked
        });
        while inner.slot_map.len() < self.config.session_concurrency {
            inner.data_seq += 1;
            let id = inner.data_seq;
            inner.slot_map.insert(id, Arc::new(SessionRecord::new(id)));
        }
        logger_trace!(
            self.logger,
            "{:?} request-ids current={} marked={:?} max={}",
            self,
            current,
            marked,
            inner.data_seq
        );
        inner.data_seq
    }

    /// Handle a request stream from the client.
    ///
    /// Runs it on the first arrival, answers a retransmit with the cached response,
    /// drops a duplicate of a request still running.
    pub fn on_data_stream(&self, mut stream: Stream) -> Result<(), RpcError> {
        self.touch();
        if stream.kind() != Some(StreamKind::RpcRequest) {
            return Err(ERR_STREAM.msg(format!("unexpected data stream kind {}", stream.get_kind())));
        }
        let cb = stream.get_callback_id();
        let (record, conn) = {
            let inner = self.lock();
            (inner.slot_map.get(&cb).cloned(), inner.conn.clone())
        };
        let Some(record) = record else {
            return Err(ERR_CALLBACK_NOT_FOUND.msg(format!("callback id {} is not allocated", cb)));
        };
        if record.set_running() {
            stream.set_session_id(self.id);
            logger_trace!(self.logger, "{:?} dispatch {:?}", self, stream);
            self.processor.on_receive_stream(stream);
        } else if let Some(resp) = record.get_response() {
            logger_trace!(self.logger, "{:?} retransmit response of {}", self, cb);
            if let Some(conn) = conn {
                self.write_to(&conn, resp);
            }
        } else {
            // still running, its own response answers this copy too
            logger_trace!(self.logger, "{:?} drop duplicated request {} {:?}", self, cb, record);
        }
        Ok(())
    }

    /// Cache a response from the processor and send it if a connection is bound
    pub fn on_return_stream(&self, mut stream: Stream) {
        if stream.kind() == Some(StreamKind::RpcResponseError) && !stream.get_status_bit_debug() {
            Self::sanitize(&mut stream);
        }
        stream.build_stream_check();
        let cb = stream.get_callback_id();
        let (record, conn) = {
            let inner = self.lock();
            (inner.slot_map.get(&cb).cloned(), inner.conn.clone())
        };
        let Some(record) = record else {
            logger_debug!(self.logger, "{:?} drop response {}, slot is gone", self, cb);
            return;
        };
        if !record.set_response(stream) {
            logger_debug!(self.logger, "{:?} drop response {}, {:?}", self, cb, record);
            return;
        }
        if let (Some(conn), Some(resp)) = (conn, record.get_response()) {
            self.write_to(&conn, resp);
        }
    }

    /// Panic details never reach a client without the debug bit
    fn sanitize(stream: &mut Stream) {
        stream.set_read_pos_to_body_start();
        let Ok(code) = stream.read_uint64() else {
            return;
        };
        if !RpcError::from_code(code, String::new()).kind().is_panic() {
            return;
        }
        stream.set_write_pos(rtrpc_core::stream::STREAM_HEAD_SIZE);
        stream.write_uint64(code);
        stream.write_string(proto::SANITIZED_MESSAGE);
    }

    /// Forward a broadcast to the bound connection, dropped when detached
    pub fn on_broadcast(&self, mut stream: Stream) {
        stream.build_stream_check();
        match self.get_conn() {
            Some(conn) => {
                self.write_to(&conn, &stream);
            }
            None => {
                logger_trace!(self.logger, "{:?} drop broadcast, no connection", self);
            }
        }
    }

    /// Write an asynchronous error report on `conn`
    pub fn report_error(&self, conn: &Arc<dyn StreamConn>, callback_id: u64, err: &RpcError) {
        let mut s = proto::new_error_report(self.id, callback_id, err);
        s.build_stream_check();
        if let Err(e) = conn.write_stream(&s, self.config.write_timeout) {
            logger_debug!(self.logger, "{:?} lost report {} on {:?}: {}", self, err, conn, e);
        }
    }

    /// Allocated ids, sorted
    pub fn slot_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().slot_map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get_record(&self, id: u64) -> Option<Arc<SessionRecord>> {
        self.lock().slot_map.get(&id).cloned()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "session({})", self.id)
    }
}
