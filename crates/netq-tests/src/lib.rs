//! netq Test & Validation Infrastructure
//!
//! End-to-end tests for the remoting subsystem over real loopback sockets:
//! call modes, timeouts, permits, dispatch, TLS, connection failure handling
//! and property tests for the wire codec.

pub mod harness;

#[cfg(test)]
mod proptest_protocol;
#[cfg(test)]
mod scenario_tests;

pub use harness::{
    delayed_echo, echo_processor, generate_tls_pair, init_tracing, start_pair, wait_until, TestPair,
};
