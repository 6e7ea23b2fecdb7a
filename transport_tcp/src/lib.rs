//! # rtrpc-tcp
//!
//! This crate provides a TCP transport implementation for [`rtrpc`](https://docs.rs/rtrpc).
//! It is used for both client and server communication over TCP.
//!
//! ```ignore
//! use rtrpc_tcp::{ServerTcpExt, tcp_dial};
//!
//! server.listen_tcp("127.0.0.1:8080");
//! server.open()?;
//! let client = Client::connect(ClientConfig::default(), tcp_dial("127.0.0.1:8080", timeout))?;
//! ```

pub mod net;
pub use net::{TcpConn, TcpStreamListener};

use rtrpc::error::RpcError;
use rtrpc::{Server, StreamConn, StreamListener};
use std::sync::Arc;
use std::time::Duration;

/// Bind a TCP listener on every `Server::open`
pub trait ServerTcpExt {
    fn listen_tcp(&mut self, addr: &str) -> &mut Self;
}

impl ServerTcpExt for Server {
    fn listen_tcp(&mut self, addr: &str) -> &mut Self {
        let addr = addr.to_string();
        self.listen(move || {
            let l: Arc<dyn StreamListener> = TcpStreamListener::bind(&addr)?;
            Ok(l)
        })
    }
}

/// Dial function for `Client::connect`, called again on every reconnect
pub fn tcp_dial(
    addr: &str, timeout: Duration,
) -> impl Fn() -> Result<Arc<dyn StreamConn>, RpcError> + Send + Sync + 'static {
    let addr = addr.to_string();
    move || {
        let conn: Arc<dyn StreamConn> = TcpConn::connect(&addr, timeout)?;
        Ok(conn)
    }
}
