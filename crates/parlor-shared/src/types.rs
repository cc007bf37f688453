use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_USER_ID_LEN;
use crate::error::UserIdError;

/// Identity attached to every envelope a connection sends.
///
/// Either taken from the `userID` hint on the upgrade request or generated
/// by the server. The value is opaque to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// A fresh, process-unique id.
    pub fn generate() -> Self {
        Self(format!("user_{}", Uuid::new_v4().simple()))
    }

    /// Accept a client-supplied hint.
    ///
    /// Returns `Ok(None)` when the hint is blank so the caller can fall back
    /// to [`UserId::generate`].
    pub fn from_hint(hint: &str) -> Result<Option<Self>, UserIdError> {
        let hint = hint.trim();
        if hint.is_empty() {
            return Ok(None);
        }
        if hint.len() > MAX_USER_ID_LEN {
            return Err(UserIdError::TooLong {
                len: hint.len(),
                max: MAX_USER_ID_LEN,
            });
        }
        if hint.chars().any(char::is_control) {
            return Err(UserIdError::ControlCharacter);
        }
        Ok(Some(Self(hint.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
