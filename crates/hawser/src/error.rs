use std::{io, sync::Arc};

use thiserror::Error;

/// Failure kinds surfaced through completion callbacks and lifecycle
/// notifications.
///
/// OS-level failures are passed through as [`Error::Io`] with their native
/// error code intact. The enum is `Clone` so a single failure can be reported
/// to both a send completion and the connection's lifecycle notify.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("{0}")]
    Io(Arc<io::Error>),
    #[error("parse ip address error")]
    ParseIpAddress,
    #[error("packet assemble creator not set")]
    AssembleCreatorNotSet,
    #[error("send queue is full")]
    SendQueueFull,
    #[error("socket not connected")]
    NotConnected,
    /// The packet assembler demanded teardown.
    #[error("packet assemble requested disconnect")]
    RequireDisconnect,
    /// The user called `disconnect`.
    #[error("user called disconnect")]
    CallDisconnect,
    #[error("body size error")]
    BodySize,
    #[error("read header error")]
    HeaderRead,
    #[error("tcp server already started")]
    AlreadyStarted,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Native OS error code, when this is an I/O passthrough.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        assert_eq!(Error::SendQueueFull.to_string(), "send queue is full");
        assert_eq!(Error::NotConnected.to_string(), "socket not connected");
        assert_eq!(Error::BodySize.to_string(), "body size error");
        assert_eq!(Error::HeaderRead.to_string(), "read header error");
        assert_eq!(Error::AlreadyStarted.to_string(), "tcp server already started");
    }

    #[test]
    fn io_passthrough_keeps_os_code() {
        let err = Error::from(io::Error::from_raw_os_error(111));
        assert_eq!(err.raw_os_error(), Some(111));
        assert_eq!(Error::BodySize.raw_os_error(), None);
    }
}
