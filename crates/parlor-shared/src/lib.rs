//! # parlor-shared
//!
//! Wire types shared by the Parlor relay and its clients: the JSON
//! [`Envelope`](envelope::Envelope), user identity, and protocol constants.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod types;

pub use envelope::{Envelope, EnvelopeKind};
pub use error::{EnvelopeError, UserIdError};
pub use types::UserId;
