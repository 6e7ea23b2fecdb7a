//! # rtrpc-core
//!
//! This crate provides the core utilities for [`rtrpc`](https://docs.rs/rtrpc).
//! It includes the stream codec, the value model, error types and configuration
//! shared by the other crates in the workspace.

#[macro_use]
extern crate captains_log;

pub mod config;
pub use config::{ClientConfig, ServerConfig};
pub mod error;
mod generator;
pub use generator::StreamGenerator;
mod hub;
pub use hub::{ErrorLogSink, LogSink, StreamHub, StreamReceiver};
pub mod stream;
pub use stream::{Stream, StreamKind};
pub mod time;
pub mod value;
pub use value::{Array, Bytes, Map, Value};
