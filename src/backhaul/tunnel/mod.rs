//! Reverse tunnel: a client behind NAT keeps one control connection to a
//! public server, which exposes the client's local TCP/UDP services on ports
//! of its own and multiplexes their traffic over that connection.

pub mod auth;
pub mod client;
pub mod control;
pub mod frame;
pub mod ports;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod udp;
