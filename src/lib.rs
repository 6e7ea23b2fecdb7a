//! # rtrpc
//!
//! Session-multiplexed RPC over a self-describing binary stream codec.
//!
//! A [Server] mounts a tree of [Service] nodes, each action is addressed by a path like
//! `#.user.profile:Get`. Clients hold a session that survives reconnects, and every
//! request is executed at most once even when retransmitted.
//!
//! Handlers run on a pool of worker threads and talk to the framework through a
//! [Runtime]: reply, call other actions on the same worker, post broadcasts, and read
//! arguments lazily as [RTValue] without copying them out of the request.
//!
//! ```ignore
//! let mut server = Server::new(ServerConfig::default());
//! server.add_service(
//!     "user",
//!     Service::new().on("SayHello", |rt: Runtime, name: String| -> Return {
//!         rt.reply(format!("hello {}", name))
//!     }),
//! );
//! server.listen(|| Ok(TcpStreamListener::bind("127.0.0.1:8080")? as Arc<dyn StreamListener>));
//! server.open()?;
//! server.run()?;
//! ```

#[macro_use]
extern crate captains_log;

pub use rtrpc_core::{config, error, stream, time, value};
pub use rtrpc_core::{
    Array, Bytes, ClientConfig, ErrorLogSink, LogSink, Map, ServerConfig, Stream, StreamGenerator,
    StreamHub, StreamKind, StreamReceiver, Value,
};
pub use rtrpc_core::error::RpcError;

mod client;
pub use client::Client;
mod conn;
pub use conn::{MemConn, StreamConn, StreamListener};
mod processor;
pub use processor::Processor;
pub mod proto;
mod rt_value;
pub use rt_value::{RTArray, RTMap, RTValue};
mod runtime;
pub use runtime::{ReplyValue, Return, Runtime};
mod server;
pub use server::Server;
mod service;
pub use service::{ArgDecoder, ArgType, Handler, ROOT_NODE, Service};
pub mod session;
pub use session::{Session, SessionManager};
