//! Route complete streams by kind

use crate::error::RpcError;
use crate::stream::{Stream, StreamKind};
use chrono::{SecondsFormat, Utc};
use log::*;
use std::sync::Arc;

/// Anything that accepts a complete stream
pub trait StreamReceiver: Send + Sync + 'static {
    fn on_receive_stream(&self, stream: Stream);
}

impl<F: Fn(Stream) + Send + Sync + 'static> StreamReceiver for F {
    #[inline]
    fn on_receive_stream(&self, stream: Stream) {
        (self)(stream)
    }
}

/// Destination of formatted system error lines
pub trait LogSink: Send + Sync + 'static {
    fn write_line(&self, line: &str);
}

/// Forward lines to the `error!` log
pub struct ErrorLogSink;

impl LogSink for ErrorLogSink {
    #[inline]
    fn write_line(&self, line: &str) {
        error!("{}", line);
    }
}

const KIND_SLOTS: usize = StreamKind::SystemErrorReport as usize + 1;

/// Demultiplex streams to one optional handler per kind, unset kinds are dropped.
pub struct StreamHub {
    handlers: [Option<Arc<dyn StreamReceiver>>; KIND_SLOTS],
    log_sink: Arc<dyn LogSink>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self { handlers: Default::default(), log_sink: Arc::new(ErrorLogSink) }
    }

    pub fn on<R: StreamReceiver>(mut self, kind: StreamKind, handler: R) -> Self {
        self.handlers[kind as usize] = Some(Arc::new(handler));
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Format `{ts} <gateway:session> {error}`, the tag is omitted without a session
    pub fn format_error_line(stream: &mut Stream) -> Option<String> {
        let code = stream.read_uint64().ok()?;
        let message = stream.read_string().ok()?;
        let err = RpcError::from_code(code, message);
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let session_id = stream.get_session_id();
        if session_id != 0 {
            Some(format!("{} <{}:{}> {}", ts, stream.get_gateway_id(), session_id, err))
        } else {
            Some(format!("{} {}", ts, err))
        }
    }

    fn report_error(&self, stream: &mut Stream) {
        let pos = stream.get_read_pos();
        match Self::format_error_line(stream) {
            Some(line) => self.log_sink.write_line(&line),
            None => warn!("malformed system error report {:?}", stream),
        }
        stream.set_read_pos(pos);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReceiver for StreamHub {
    fn on_receive_stream(&self, mut stream: Stream) {
        let Some(kind) = stream.kind() else {
            warn!("drop stream of unknown kind {}", stream.get_kind());
            return;
        };
        if kind == StreamKind::SystemErrorReport {
            self.report_error(&mut stream);
        }
        match &self.handlers[kind as usize] {
            Some(handler) => {
                trace!("hub route {:?}", stream);
                handler.on_receive_stream(stream);
            }
            None => {
                trace!("hub drop {:?}, no handler for {}", stream, kind);
            }
        }
    }
}
