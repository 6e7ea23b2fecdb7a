//! Connection abstraction consumed by the session layer.
//!
//! A transport must deliver complete streams atomically: either the exact bytes that
//! were written, or an error.

use crate::error::*;
use crossfire::{MRx, MTx};
use rtrpc_core::Stream;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait StreamConn: Send + Sync + fmt::Debug + 'static {
    /// Wait for a complete stream. Streams longer than `size_limit` are rejected.
    fn read_stream(&self, timeout: Duration, size_limit: usize) -> Result<Stream, RpcError>;

    /// The stream must have been built with `build_stream_check`
    fn write_stream(&self, stream: &Stream, timeout: Duration) -> Result<(), RpcError>;

    fn close(&self) -> Result<(), RpcError>;
}

/// Interface for transport server listener
pub trait StreamListener: Send + Sync + fmt::Debug + 'static {
    /// Wait up to `timeout` for a new connection, Ok(None) when nothing arrived
    fn accept(&self, timeout: Duration) -> Result<Option<Arc<dyn StreamConn>>, RpcError>;

    fn local_addr(&self) -> String;

    fn close(&self);
}

const MEM_POLL_INTERVAL: Duration = Duration::from_millis(20);

static MEM_CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// In-process connection, one end of a pair created by [MemConn::pair].
///
/// Streams are passed as raw bytes and verified on receipt like a socket transport.
pub struct MemConn {
    id: u64,
    tx: MTx<Vec<u8>>,
    rx: MRx<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl MemConn {
    pub fn pair() -> (Arc<MemConn>, Arc<MemConn>) {
        let (tx_a, rx_b) = crossfire::mpmc::unbounded_blocking::<Vec<u8>>();
        let (tx_b, rx_a) = crossfire::mpmc::unbounded_blocking::<Vec<u8>>();
        let closed = Arc::new(AtomicBool::new(false));
        let id = MEM_CONN_SEQ.fetch_add(1, Ordering::Relaxed);
        let a = MemConn { id: id * 2, tx: tx_a, rx: rx_a, closed: closed.clone() };
        let b = MemConn { id: id * 2 + 1, tx: tx_b, rx: rx_b, closed };
        (Arc::new(a), Arc::new(b))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send raw bytes without any check, for feeding malformed input
    pub fn write_raw(&self, buf: Vec<u8>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(ERR_TRANSPORT_CLOSED.to_err());
        }
        if self.tx.send(buf).is_err() {
            return Err(ERR_TRANSPORT_CLOSED.to_err());
        }
        Ok(())
    }
}

impl fmt::Debug for MemConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MemConn({})", self.id)
    }
}

impl StreamConn for MemConn {
    fn read_stream(&self, timeout: Duration, size_limit: usize) -> Result<Stream, RpcError> {
        let deadline = Instant::now() + timeout;
        // streams written before the close are still delivered
        loop {
            let now = Instant::now();
            let wait = if self.is_closed() {
                Duration::ZERO
            } else if now >= deadline {
                return Err(ERR_TRANSPORT_TIMEOUT.to_err());
            } else {
                std::cmp::min(deadline - now, MEM_POLL_INTERVAL)
            };
            let r = if wait.is_zero() { self.rx.try_recv().ok() } else { self.rx.recv_timeout(wait).ok() };
            if r.is_none() && self.is_closed() {
                return Err(ERR_TRANSPORT_CLOSED.to_err());
            }
            if let Some(buf) = r {
                if buf.len() > size_limit {
                    return Err(ERR_TRANSPORT_STREAM_LENGTH
                        .msg(format!("stream length {} exceeds {}", buf.len(), size_limit)));
                }
                let Some(stream) = Stream::from_bytes(&buf) else {
                    return Err(ERR_STREAM.msg("stream shorter than header"));
                };
                if !stream.check_stream() {
                    return Err(ERR_STREAM.msg("stream check failed"));
                }
                return Ok(stream);
            }
        }
    }

    fn write_stream(&self, stream: &Stream, _timeout: Duration) -> Result<(), RpcError> {
        self.write_raw(stream.to_vec())
    }

    fn close(&self) -> Result<(), RpcError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
