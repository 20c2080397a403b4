/// Errors for payloads that are well-framed but semantically malformed.
///
/// A frame can carry a valid checksum and still hold garbage; these errors
/// keep such payloads from ever being presented as valid telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The payload is shorter than the record it claims to contain.
    #[error("payload too short: required {required} bytes, got {actual}")]
    TooShort { required: usize, actual: usize },
    /// A decoded count field exceeds the protocol's hardware limit.
    #[error("{field} out of range: {actual} exceeds maximum {max}")]
    InvalidCount {
        field: &'static str,
        max: u8,
        actual: u8,
    },
}

/// Errors in the framing layer.
///
/// These are non-fatal for a running stream: the reassembler reports them as
/// events and resynchronizes on the next start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// No start marker where one was expected.
    #[error("missing start marker")]
    BadStart,
    /// The end marker byte is wrong.
    #[error("missing end marker")]
    BadEnd,
    /// Markers and length are fine but the checksum does not add up.
    #[error("invalid checksum: calculated {calculated:#06X}, received {received:#06X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The declared length field does not match the actual frame size.
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// A partial frame sat in the reassembler longer than the configured
    /// timeout and was abandoned.
    #[error("partial frame timed out")]
    Timeout,
}

impl FrameError {
    /// Whether the error invalidates the surrounding byte positions.
    ///
    /// Structural errors mean the scan position itself cannot be trusted and
    /// the reassembler must hunt for a fresh start marker. A checksum
    /// mismatch on an otherwise well-formed frame only invalidates that one
    /// frame, which is simply dropped.
    pub fn is_structural(&self) -> bool {
        !matches!(self, FrameError::ChecksumMismatch { .. })
    }
}
