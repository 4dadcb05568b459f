//! Embeddable TCP networking library.
//!
//! Two complementary facades share one framing abstraction:
//!
//! - [`TcpClient`] maintains a fleet of named server connections with
//!   per-target reconnection policies, ordered non-blocking sends with
//!   per-connection back-pressure, and lifecycle notifications.
//! - [`TcpServer`] accepts connections on a bound endpoint and hands each
//!   one a fresh parser.
//! - [`assemble::PacketAssemble`] converts the raw byte stream of a
//!   connection into application messages;
//!   [`assemble::HeaderBodyAssemble`] implements the common
//!   length-prefixed-header wire format, robust to arbitrary chunking.
//!
//! All I/O is reactor-driven: each facade owns a single-threaded control
//! executor (registries, DNS, accepts, reconnect timers, notifications) and
//! a pool of transfer threads (socket reads/writes, parser invocation). No
//! call on the public API blocks on the network.

pub mod assemble;
pub mod byte_order;
mod endpoint;
mod error;
mod reactor;
mod tcp;

pub use endpoint::Endpoint;
pub use error::Error;
pub use tcp::{
    ConnectionHandle, ConnectionMeta, SendCallback, TcpClient, TcpClientNotify, TcpServer,
};
