//! Stream-to-message parsing.
//!
//! A packet assembler turns the raw TCP byte stream of one connection into
//! application-level messages. Implement [`PacketAssemble`] for a custom wire
//! format, or use [`HeaderBodyAssemble`] for the common
//! length-prefixed-header layout.

use std::sync::Arc;

use crate::ConnectionHandle;

mod header_body;
pub use header_body::{
    BodyLengthCalcMode, FrameHeader, HeaderBodyAssemble, HeaderBodyAssembleNotify, LengthField,
};

/// Outcome of feeding received bytes to a parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataReadResult {
    /// Bytes consumed; keep reading.
    Success,
    /// Non-fatal parse problem; logged, reading continues.
    Error,
    /// Fatal; the connection is torn down and its error notify fires with
    /// [`crate::Error::RequireDisconnect`].
    Disconnect,
}

/// A stateful stream parser. One instance is owned per connection and only
/// ever invoked from that connection's transfer thread.
pub trait PacketAssemble: Send {
    fn data_received(&mut self, connection: &ConnectionHandle, data: &[u8]) -> DataReadResult;
}

/// Factory producing a fresh parser per connection: one per accepted socket
/// on the server side, one per connect attempt on the client side.
pub type AssembleCreator = Arc<dyn Fn() -> Box<dyn PacketAssemble> + Send + Sync>;
