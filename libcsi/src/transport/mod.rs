//! gRPC transport for CSI calls.
//!
//! [`connection`] dials the driver socket, [`client`] issues unary calls on
//! the resulting channel, and [`log`] renders payloads for tracing.

pub mod client;
pub mod connection;
pub mod log;
