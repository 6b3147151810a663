//! Core of an in-memory key-value store: a single-threaded reactor over a
//! pluggable readiness backend, a polymorphic object model with compact
//! encodings, the wire protocol, client lifecycle, pub/sub routing and a
//! small pool of background workers for blocking fd operations.
//!
//! The keyspace itself is a consumer-provided abstraction; see
//! [`keyspace::Keyspace`]. The binary crate wires an in-memory store, the
//! data commands and the configuration together.

pub mod bgjobs;
pub mod client;
pub mod codec;
pub mod config;
pub mod crc64;
pub mod dump;
pub mod glob;
pub mod keyspace;
pub mod logging;
pub mod netio;
pub mod notify;
pub mod object;
pub mod protocol;
pub mod pubsub;
pub mod reactor;
pub mod server;
pub mod slowlog;
pub mod util;

pub use crate::object::Obj;
pub use crate::server::Server;
