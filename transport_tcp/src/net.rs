use crossfire::MRx;
use log::*;
use rtrpc::error::*;
use rtrpc::{Stream, StreamConn, StreamGenerator, StreamListener};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use std::{fmt, thread};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);
const READ_BUF_SIZE: usize = 16 * 1024;

/// Parse `ip:port`, or resolve `host:port` and take the first result
pub fn parse_addr(addr: &str) -> Result<SocketAddr, RpcError> {
    match addr.parse::<SocketAddr>() {
        Ok(a) => Ok(a),
        Err(e) => match addr.to_socket_addrs() {
            Ok(mut resolved) => match resolved.next() {
                Some(a) => Ok(a),
                None => Err(ERR_CONFIG.msg(format!("{} resolves to nothing", addr))),
            },
            Err(_) => Err(ERR_CONFIG.msg(format!("invalid addr {:?}: {}", addr, e))),
        },
    }
}

#[inline]
fn write_err(e: io::Error) -> RpcError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ERR_TRANSPORT_TIMEOUT.msg(e.to_string())
        }
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => ERR_TRANSPORT_CLOSED.msg(e.to_string()),
        _ => ERR_TRANSPORT_WRITE.msg(e.to_string()),
    }
}

type Generator = StreamGenerator<Box<dyn FnMut(Stream) + Send>>;

struct ReadState {
    sock: TcpStream,
    generator: Generator,
    buf: Vec<u8>,
    /// Framing error seen after streams that are still queued
    failed: Option<RpcError>,
}

/// A stream socket carrying whole streams: the 48 byte head, then `length - 48` body bytes.
///
/// Received bytes go through a [StreamGenerator], a partial stream survives a read timeout.
pub struct TcpConn {
    reader: Mutex<ReadState>,
    ready: MRx<Stream>,
    writer: Mutex<TcpStream>,
    local: String,
    peer: String,
    closed: AtomicBool,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Result<Self, RpcError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let writer = stream.try_clone()?;
        let (tx, ready) = crossfire::mpmc::unbounded_blocking::<Stream>();
        let on_stream: Box<dyn FnMut(Stream) + Send> = Box::new(move |s: Stream| {
            let _ = tx.send(s);
        });
        let state = ReadState {
            sock: stream,
            generator: StreamGenerator::new(usize::MAX, on_stream),
            buf: vec![0u8; READ_BUF_SIZE],
            failed: None,
        };
        Ok(Self {
            reader: Mutex::new(state),
            ready,
            writer: Mutex::new(writer),
            local,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn connect(addr: &str, timeout: Duration) -> Result<Arc<Self>, RpcError> {
        let sock_addr = parse_addr(addr)?;
        let stream = TcpStream::connect_timeout(&sock_addr, timeout.max(MIN_IO_TIMEOUT))
            .map_err(|e| ERR_TRANSPORT_CLOSED.msg(format!("connect {}: {}", addr, e)))?;
        let conn = Arc::new(Self::new(stream)?);
        debug!("{:?} connected", conn);
        Ok(conn)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn lock_reader(&self) -> MutexGuard<'_, ReadState> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline(always)]
    fn lock_writer(&self) -> MutexGuard<'_, TcpStream> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TcpConn({}->{})", self.local, self.peer)
    }
}

impl StreamConn for TcpConn {
    fn read_stream(&self, timeout: Duration, size_limit: usize) -> Result<Stream, RpcError> {
        if self.is_closed() {
            return Err(ERR_TRANSPORT_CLOSED.to_err());
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock_reader();
        let state = &mut *guard;
        state.generator.set_max_len(size_limit);
        loop {
            if let Ok(stream) = self.ready.try_recv() {
                trace!("{:?} read {} bytes", self, stream.get_length());
                return Ok(stream);
            }
            if let Some(e) = state.failed.take() {
                return Err(e);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ERR_TRANSPORT_TIMEOUT.to_err());
            }
            state.sock.set_read_timeout(Some((deadline - now).max(MIN_IO_TIMEOUT)))?;
            match state.sock.read(&mut state.buf) {
                Ok(0) => {
                    if !state.generator.is_idle() {
                        return Err(ERR_TRANSPORT_READ.msg("stream truncated by peer"));
                    }
                    return Err(ERR_TRANSPORT_CLOSED.msg("connection closed by peer"));
                }
                Ok(n) => {
                    if let Err(e) = state.generator.on_bytes(&state.buf[..n]) {
                        state.failed = Some(e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_stream(&self, stream: &Stream, timeout: Duration) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(ERR_TRANSPORT_CLOSED.to_err());
        }
        let mut sock = self.lock_writer();
        sock.set_write_timeout(Some(timeout.max(MIN_IO_TIMEOUT))).map_err(write_err)?;
        for seg in stream.segments() {
            sock.write_all(seg).map_err(write_err)?;
        }
        sock.flush().map_err(write_err)?;
        Ok(())
    }

    fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("{:?} close", self);
        // wakes up a blocked reader
        let _ = self.lock_writer().shutdown(Shutdown::Both);
        Ok(())
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Nonblocking listener polled by the server's accept thread
pub struct TcpStreamListener {
    listener: TcpListener,
    addr: String,
    closed: AtomicBool,
}

impl TcpStreamListener {
    pub fn bind(addr: &str) -> Result<Arc<Self>, RpcError> {
        let sock_addr = parse_addr(addr)?;
        let listener = match TcpListener::bind(sock_addr) {
            Ok(l) => l,
            Err(e) => {
                error!("Fail to bind on addr {:?}: {:?}", sock_addr, e);
                return Err(ERR_CONFIG.msg(format!("bind {}: {}", addr, e)));
            }
        };
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| addr.to_string());
        info!("listen on {:?}", addr);
        Ok(Arc::new(Self { listener, addr, closed: AtomicBool::new(false) }))
    }
}

impl fmt::Debug for TcpStreamListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "listener {}", self.addr)
    }
}

impl StreamListener for TcpStreamListener {
    fn accept(&self, timeout: Duration) -> Result<Option<Arc<dyn StreamConn>>, RpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ERR_TRANSPORT_CLOSED.msg(format!("{:?} is closed", self)));
            }
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let conn: Arc<dyn StreamConn> = Arc::new(TcpConn::new(stream)?);
                    return Ok(Some(conn));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(std::cmp::min(ACCEPT_POLL_INTERVAL, deadline - now));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ERR_TRANSPORT_READ.msg(format!("{:?} accept: {}", self, e))),
            }
        }
    }

    #[inline]
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
