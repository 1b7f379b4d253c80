//! Text codec and binary run framing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Maximum size of a structured (text) message (1 MiB).
pub const MAX_TEXT_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum size of a single declared binary run (1 GiB).
pub const MAX_BINARY_RUN_SIZE: u64 = 1024 * 1024 * 1024;

/// A closed set of message types accepted from one peer role.
pub trait Envelope: DeserializeOwned {
    /// Values of the `type` tag this envelope understands.
    const TYPES: &'static [&'static str];
}

/// Codec for encoding and decoding structured messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Codec {
    /// Encodes a message as a JSON text frame.
    pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
        serde_json::to_string(message).map_err(|e| ProtocolError::Serialisation(e.to_string()))
    }

    /// Decodes a text frame into the envelope of the peer's role.
    ///
    /// Distinguishes a missing tag, a tag foreign to the role, and a known
    /// tag with a bad body, so the error envelope sent back is specific.
    pub fn decode<T: Envelope>(text: &str) -> Result<T, ProtocolError> {
        if text.len() > MAX_TEXT_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len() as u64,
                max: MAX_TEXT_MESSAGE_SIZE as u64,
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_owned();

        if !T::TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownMessageType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }
}

/// Tracks a declared run of binary frames on one connection.
///
/// A structured message announces `bytes`; binary frames are then consumed
/// against that count. While bytes remain, text frames are a protocol error,
/// and a binary frame with nothing declared is one too.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BinaryRun {
    remaining: u64,
    last: bool,
}

impl BinaryRun {
    /// Creates an idle run tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            remaining: 0,
            last: false,
        }
    }

    /// Opens a run of `bytes`. `last` marks the run as the final one of a
    /// transfer.
    pub fn open(&mut self, bytes: u64, last: bool) -> Result<(), ProtocolError> {
        self.ensure_idle()?;
        if bytes == 0 {
            return Err(ProtocolError::EmptyBinary);
        }
        if bytes > MAX_BINARY_RUN_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes,
                max: MAX_BINARY_RUN_SIZE,
            });
        }
        self.remaining = bytes;
        self.last = last;
        Ok(())
    }

    /// Consumes a binary frame of `len` bytes.
    ///
    /// Returns `true` when this frame completes a run that was opened with
    /// `last` set.
    pub fn accept(&mut self, len: usize) -> Result<bool, ProtocolError> {
        if len == 0 {
            return Err(ProtocolError::EmptyBinary);
        }
        if self.remaining == 0 {
            return Err(ProtocolError::UnexpectedBinary(len));
        }
        let len_u64 = len as u64;
        if len_u64 > self.remaining {
            return Err(ProtocolError::BinaryOverrun {
                len,
                remaining: self.remaining,
            });
        }
        self.remaining -= len_u64;
        Ok(self.remaining == 0 && self.last)
    }

    /// Fails if a run is still open.
    pub fn ensure_idle(&self) -> Result<(), ProtocolError> {
        if self.remaining > 0 {
            return Err(ProtocolError::TextDuringBinary(self.remaining));
        }
        Ok(())
    }

    /// Bytes still expected in the open run.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Returns true while binary frames are expected.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.remaining > 0
    }
}
