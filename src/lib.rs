#![warn(missing_docs, rust_2018_idioms, unused_imports)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! drover is a high-concurrency TCP client agent: a long-lived component
//! that initiates and multiplexes many outbound connections across a fixed
//! pool of epoll-driven worker threads, delivering each connection's byte
//! stream to an application [`AgentHandler`] without blocking any worker.
//!
//! ## Overview
//!
//! Build a [`TcpAgent`] from a handler and an [`AgentConfig`], `start` it,
//! then `connect` to as many peers as the configured limit allows. Every
//! public call is thread-safe and non-blocking; connection events
//! (`on_connect`, `on_receive`, `on_send`, `on_close`) arrive on the worker
//! that owns the connection's descriptor.
//!
//! ```no_run
//! use drover::{AgentConfig, AgentHandler, ConnId, HandleResult, Operation, TcpAgent};
//!
//! struct Echoless;
//!
//! impl AgentHandler for Echoless {
//!     fn on_receive(&self, conn_id: ConnId, data: &[u8]) -> HandleResult {
//!         println!("{conn_id}: {} bytes", data.len());
//!         HandleResult::Continue
//!     }
//!
//!     fn on_close(&self, conn_id: ConnId, op: Operation, err: Option<std::io::Error>) {
//!         println!("{conn_id} closed: {op:?} {err:?}");
//!     }
//! }
//!
//! let agent = TcpAgent::new(Echoless, AgentConfig::default()).unwrap();
//! agent.start(None, true).unwrap();
//! let id = agent.connect("127.0.0.1", 9000).unwrap();
//! agent.send(id, b"ABCD").unwrap();
//! # agent.stop().unwrap();
//! ```

mod agent;
mod buffer;
mod clock;
mod config;
mod conn;
mod dispatcher;
mod error;
mod handler;
mod table;

pub use agent::{AgentState, ConnectOptions, TcpAgent};
pub use config::{
    AgentConfig, ReusePolicy, SendPolicy, MAX_CONNECTION_COUNT, MAX_WORKER_THREAD_COUNT,
    MIN_SOCKET_BUFFER_SIZE,
};
pub use conn::{ConnId, ConnState, UserData};
pub use error::{AgentError, Result};
pub use handler::{AgentHandler, HandleResult, Operation};
