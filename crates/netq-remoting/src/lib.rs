#![warn(missing_docs)]

//! netq remoting subsystem: length-framed TCP/TLS transport, request/response
//! correlation with sync, callback and one-way calls, elastic worker scheduler

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod drain;
pub mod error;
pub mod invoke;
pub mod metrics;
pub mod pipeline;
pub mod processor;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod tls;

pub use channel::Channel;
pub use client::RemotingClient;
pub use config::{ClientConfig, IdlePolicy, SchedulerConfig, ServerConfig, TlsConfig};
pub use error::{RemotingError, Result};
pub use processor::{Processor, RpcHook};
pub use protocol::{response_code, Command, CommandFlags};
pub use scheduler::ElasticScheduler;
pub use server::RemotingServer;
