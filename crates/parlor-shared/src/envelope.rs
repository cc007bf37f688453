//! Wire envelope exchanged between clients and the relay.
//!
//! One UTF-8 JSON object per WebSocket frame. Empty strings and zero numbers
//! are omitted when encoding, so a `client_count` envelope never carries any
//! user attribution.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::MILLIS_THRESHOLD;
use crate::error::EnvelopeError;
use crate::types::UserId;

/// Envelope discriminator (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    #[default]
    Message,
    Typing,
    File,
    ClientCount,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::File => "file",
            Self::ClientCount => "client_count",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "typing" => Ok(Self::Typing),
            "file" => Ok(Self::File),
            "client_count" => Ok(Self::ClientCount),
            other => Err(EnvelopeError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// `None` until the server fills in the default.
    #[serde(
        rename = "type",
        default,
        deserialize_with = "deserialize_kind",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<EnvelopeKind>,

    #[serde(
        rename = "userID",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub user_id: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub username: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub content: String,

    /// Seconds since the Unix epoch once normalized.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero_i64"
    )]
    pub timestamp: i64,

    #[serde(
        rename = "clientCount",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero_u64"
    )]
    pub client_count: u64,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub filename: String,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero_i64"
    )]
    pub filesize: i64,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub filetype: String,

    /// Embedded file payload, typically base64.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub filedata: String,
}

impl Envelope {
    /// Live connection count update, built by the hub only.
    pub fn client_count(count: u64, now: i64) -> Self {
        Self {
            kind: Some(EnvelopeKind::ClientCount),
            client_count: count,
            timestamp: now,
            ..Self::default()
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(EnvelopeError::Decode)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind.unwrap_or_default()
    }

    /// Turn a decoded peer envelope into the copy that gets broadcast.
    ///
    /// The sender's identity replaces whatever `userID` the peer claimed,
    /// the timestamp is normalized to seconds, a missing type becomes
    /// `message`, and the result is validated for its variant.
    pub fn prepare_inbound(mut self, sender: &UserId, now: i64) -> Result<Self, EnvelopeError> {
        self.user_id = sender.as_str().to_string();
        self.timestamp = normalize_timestamp(self.timestamp, now);
        if self.kind.is_none() {
            self.kind = Some(EnvelopeKind::Message);
        }
        // clientCount belongs to the hub
        self.client_count = 0;
        self.validate()?;
        Ok(self)
    }

    /// Check the fields required by this envelope's variant.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match self.kind() {
            EnvelopeKind::Message if self.content.is_empty() => Err(EnvelopeError::EmptyContent),
            EnvelopeKind::File if self.filename.is_empty() => Err(EnvelopeError::MissingFilename),
            EnvelopeKind::ClientCount => Err(EnvelopeError::Reserved(EnvelopeKind::ClientCount)),
            _ => Ok(()),
        }
    }
}

/// Normalize a peer-supplied timestamp to seconds.
///
/// Zero means "unset" and becomes `now`. Values above [`MILLIS_THRESHOLD`]
/// are milliseconds and get divided down. Anything else is already seconds.
pub fn normalize_timestamp(timestamp: i64, now: i64) -> i64 {
    if timestamp == 0 {
        now
    } else if timestamp > MILLIS_THRESHOLD {
        timestamp / 1000
    } else {
        timestamp
    }
}

/// Current server time in seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn deserialize_kind<'de, D>(deserializer: D) -> Result<Option<EnvelopeKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}
