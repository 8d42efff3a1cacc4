#![forbid(unsafe_code)]

//! QUIC chat server: room registry, broadcast engine, and the wire-facing
//! connection handler. The binary in `main.rs` wires these together from
//! configuration.

pub mod config;
pub mod quic;
pub mod server;
pub mod util;
