use bytemuck::Pod;
use tracing::trace;

use crate::{
    ConnectionHandle, Error,
    assemble::{DataReadResult, PacketAssemble},
};

/// A length field embedded in a frame header.
///
/// The wire encoding is network byte order; `from_wire` converts to a host
/// value. Only 16- and 32-bit fields exist on the wire formats this parser
/// supports.
pub trait LengthField: Pod {
    fn from_wire(bytes: &[u8]) -> u64;
}

impl LengthField for u16 {
    fn from_wire(bytes: &[u8]) -> u64 {
        u16::from_be_bytes([bytes[0], bytes[1]]) as u64
    }
}

impl LengthField for u32 {
    fn from_wire(bytes: &[u8]) -> u64 {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
    }
}

/// Describes a fixed-size frame header.
///
/// The `Pod` bound statically guarantees the header is plain old data with no
/// implicit padding, so its in-memory image and its wire image coincide.
/// `LENGTH_OFFSET` is the byte offset of the length field inside the header
/// (`core::mem::offset_of!` produces it); the field's wire value is network
/// byte order. No other header field is converted by the parser — the raw
/// header is surfaced as-is and callers convert what they need.
///
/// ```ignore
/// #[derive(Clone, Copy, Pod, Zeroable)]
/// #[repr(C, packed)]
/// struct MessageHeader {
///     magic: u16,
///     len: u16,
///     reserved: u64,
/// }
///
/// impl FrameHeader for MessageHeader {
///     type Length = u16;
///     const LENGTH_OFFSET: usize = core::mem::offset_of!(MessageHeader, len);
/// }
/// ```
pub trait FrameHeader: Pod {
    type Length: LengthField;
    const LENGTH_OFFSET: usize;
}

/// How the decoded length-field value maps to the body size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyLengthCalcMode {
    /// The decoded value is the body size.
    BodyOnly,
    /// The decoded value includes the length field itself.
    WithLengthField,
    /// The decoded value includes the whole header.
    WithHeader,
    /// The decoded value includes `reserve_body_size` extra bytes.
    CustomLength { reserve_body_size: u64 },
}

/// Per-frame callbacks of [`HeaderBodyAssemble`].
pub trait HeaderBodyAssembleNotify<H: FrameHeader>: Send {
    /// Called once per frame when the header is complete, before any body
    /// byte is accumulated. Returning anything but
    /// [`DataReadResult::Success`] rejects the frame and tears the
    /// connection down with [`Error::HeaderRead`].
    fn header_read_finish(
        &mut self,
        _connection: &ConnectionHandle,
        _header: &H,
    ) -> DataReadResult {
        DataReadResult::Success
    }

    /// Called exactly once per fully accumulated frame. `Disconnect` ends
    /// the feed immediately; `Error` is non-fatal — the rest of the input is
    /// still parsed and the feed reports `Error` once it is drained.
    fn packet_reserved(
        &mut self,
        connection: &ConnectionHandle,
        header: &H,
        body: &[u8],
    ) -> DataReadResult;

    /// Called on frame validation failures, typically a bad body size.
    fn packet_read_error(&mut self, _error: &Error) {}
}

enum ParsePhase {
    Header,
    Body,
}

/// Incremental parser for length-prefixed binary frames.
///
/// Feeds may arrive in arbitrary chunks: a single call can complete several
/// frames, or end mid-header or mid-body, and the parser picks up where it
/// left off. State fully resets after every emitted frame.
pub struct HeaderBodyAssemble<H: FrameHeader> {
    notify: Box<dyn HeaderBodyAssembleNotify<H>>,
    calc_mode: BodyLengthCalcMode,
    /// Maximum accepted effective body size; 0 means unlimited.
    body_length_limit: u64,
    phase: ParsePhase,
    header_buf: Vec<u8>,
    body_buf: Vec<u8>,
    /// Bytes still missing in the current phase.
    rest: usize,
}

impl<H: FrameHeader> HeaderBodyAssemble<H> {
    const HEADER_SIZE: usize = size_of::<H>();
    const LENGTH_SIZE: usize = size_of::<H::Length>();

    /// Panics if the length field does not lie inside the header.
    pub fn new(calc_mode: BodyLengthCalcMode, notify: Box<dyn HeaderBodyAssembleNotify<H>>) -> Self {
        assert!(
            Self::LENGTH_SIZE > 0
                && H::LENGTH_OFFSET
                    .checked_add(Self::LENGTH_SIZE)
                    .is_some_and(|end| end <= Self::HEADER_SIZE),
            "length field must lie inside the header"
        );
        Self {
            notify,
            calc_mode,
            body_length_limit: 0,
            phase: ParsePhase::Header,
            header_buf: Vec::with_capacity(Self::HEADER_SIZE),
            body_buf: Vec::new(),
            rest: Self::HEADER_SIZE,
        }
    }

    pub fn with_body_length_limit(mut self, limit: u64) -> Self {
        self.body_length_limit = limit;
        self
    }

    fn effective_body_size(&self, decoded: u64) -> Result<usize, Error> {
        let subtrahend = match self.calc_mode {
            BodyLengthCalcMode::BodyOnly => 0,
            BodyLengthCalcMode::WithLengthField => Self::LENGTH_SIZE as u64,
            BodyLengthCalcMode::WithHeader => Self::HEADER_SIZE as u64,
            BodyLengthCalcMode::CustomLength { reserve_body_size } => reserve_body_size,
        };
        let size = decoded.checked_sub(subtrahend).ok_or(Error::BodySize)?;
        if self.body_length_limit > 0 && size > self.body_length_limit {
            return Err(Error::BodySize);
        }
        usize::try_from(size).map_err(|_| Error::BodySize)
    }

    fn reset(&mut self) {
        self.header_buf.clear();
        self.body_buf.clear();
        self.phase = ParsePhase::Header;
        self.rest = Self::HEADER_SIZE;
    }
}

impl<H: FrameHeader> PacketAssemble for HeaderBodyAssemble<H> {
    fn data_received(&mut self, connection: &ConnectionHandle, mut data: &[u8]) -> DataReadResult {
        let mut outcome = DataReadResult::Success;
        while !data.is_empty() {
            match self.phase {
                ParsePhase::Header => {
                    let take = self.rest.min(data.len());
                    self.header_buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    self.rest -= take;
                    if self.rest > 0 {
                        continue;
                    }

                    let header = bytemuck::pod_read_unaligned::<H>(&self.header_buf);
                    if self.notify.header_read_finish(connection, &header)
                        != DataReadResult::Success
                    {
                        self.notify.packet_read_error(&Error::HeaderRead);
                        return DataReadResult::Disconnect;
                    }

                    let decoded = H::Length::from_wire(
                        &self.header_buf[H::LENGTH_OFFSET..H::LENGTH_OFFSET + Self::LENGTH_SIZE],
                    );
                    let body_size = match self.effective_body_size(decoded) {
                        Ok(size) => size,
                        Err(err) => {
                            self.notify.packet_read_error(&err);
                            return DataReadResult::Disconnect;
                        }
                    };
                    trace!(decoded, body_size, "header complete");

                    if body_size == 0 {
                        // An empty frame is still a frame; emit and keep
                        // consuming the remaining input.
                        let result = self.notify.packet_reserved(connection, &header, &[]);
                        self.reset();
                        match result {
                            DataReadResult::Disconnect => return DataReadResult::Disconnect,
                            DataReadResult::Error => outcome = DataReadResult::Error,
                            DataReadResult::Success => {}
                        }
                        continue;
                    }

                    self.body_buf.clear();
                    self.body_buf.reserve(body_size);
                    self.rest = body_size;
                    self.phase = ParsePhase::Body;
                }
                ParsePhase::Body => {
                    let take = self.rest.min(data.len());
                    self.body_buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    self.rest -= take;
                    if self.rest > 0 {
                        continue;
                    }

                    let header = bytemuck::pod_read_unaligned::<H>(&self.header_buf);
                    let result = self.notify.packet_reserved(connection, &header, &self.body_buf);
                    self.reset();
                    match result {
                        DataReadResult::Disconnect => return DataReadResult::Disconnect,
                        DataReadResult::Error => outcome = DataReadResult::Error,
                        DataReadResult::Success => {}
                    }
                }
            }
        }
        outcome
    }
}
