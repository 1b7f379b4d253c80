//! Error types for the protocol.

use thiserror::Error;

/// Protocol errors.
///
/// Any of these on a live connection is answered with an error envelope and
/// the connection is closed. None of them is fatal to the scheduler.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Text frame is not valid JSON.
    #[error("message is not valid JSON: {0}")]
    MalformedJson(String),

    /// JSON object has no string `type` field.
    #[error("bad message, no type")]
    MissingType,

    /// Message type is not valid for this peer role.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Known message type with an invalid body.
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Message too large.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u64 },

    /// Binary frame arrived with no declared run.
    #[error("unexpected binary message of length {0}")]
    UnexpectedBinary(usize),

    /// Binary frame with no data.
    #[error("no data in binary message")]
    EmptyBinary,

    /// Binary frame larger than what the run has left.
    #[error("binary message of length {len} exceeds remaining {remaining} bytes")]
    BinaryOverrun { len: usize, remaining: u64 },

    /// Text frame while a binary run is still open.
    #[error("got structured message while {0} bytes remained of a binary run")]
    TextDuringBinary(u64),

    /// Environment descriptor fails validation.
    #[error("invalid environment descriptor: {0}")]
    InvalidDescriptor(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),
}
