use thiserror::Error;

use crate::envelope::EnvelopeKind;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Unknown envelope type: {0}")]
    UnknownKind(String),

    #[error("Empty content in message envelope")]
    EmptyContent,

    #[error("File envelope without filename")]
    MissingFilename,

    #[error("Envelope type {0} is reserved for the server")]
    Reserved(EnvelopeKind),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UserIdError {
    #[error("User id too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("User id contains control characters")]
    ControlCharacter,
}
