use std::sync::Weak;

use crate::{Error, tcp::connection::TcpConnection};

/// Cheap handle to a live connection, passed to parser notifications.
///
/// The handle holds a weak reference: it never extends the connection's
/// lifetime, and operations on a handle whose connection is gone fail with
/// [`Error::NotConnected`].
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: Weak<TcpConnection>,
}

impl ConnectionHandle {
    pub(crate) fn new(conn: Weak<TcpConnection>) -> Self {
        Self { conn }
    }

    /// A handle attached to nothing. Useful for exercising a
    /// [`crate::assemble::PacketAssemble`] implementation outside of a
    /// running connection; `send` on it always reports `NotConnected`.
    pub fn detached() -> Self {
        Self { conn: Weak::new() }
    }

    /// Sends `data` on the connection. The completion is invoked exactly
    /// once, from within the connection's serialized region.
    pub fn send(&self, data: Vec<u8>, callback: impl FnOnce(Result<(), Error>) + Send + 'static) {
        match self.conn.upgrade() {
            Some(conn) => conn.send(data, Box::new(callback)),
            None => callback(Err(Error::NotConnected)),
        }
    }

    /// Remote address as cached at connect/accept time; empty when detached.
    pub fn remote_address(&self) -> String {
        self.conn.upgrade().map(|c| c.remote_address()).unwrap_or_default()
    }

    pub fn remote_port(&self) -> u16 {
        self.conn.upgrade().map(|c| c.remote_port()).unwrap_or_default()
    }

    pub fn local_address(&self) -> String {
        self.conn.upgrade().map(|c| c.local_address()).unwrap_or_default()
    }

    pub fn local_port(&self) -> u16 {
        self.conn.upgrade().map(|c| c.local_port()).unwrap_or_default()
    }
}
