//! Provider identifier value object

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a provider identifier
pub const MAX_PROVIDER_ID_LEN: usize = 64;

/// Reasons a provider identifier can be rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidProviderId {
    /// Identifier was empty
    #[error("provider id must not be empty")]
    Empty,

    /// Identifier exceeded [`MAX_PROVIDER_ID_LEN`]
    #[error("provider id '{0}' exceeds {MAX_PROVIDER_ID_LEN} characters")]
    TooLong(String),

    /// Identifier contained a character outside `[A-Za-z0-9._-]`
    #[error("provider id '{id}' contains invalid character '{ch}'")]
    InvalidCharacter {
        /// Offending identifier
        id: String,
        /// First invalid character
        ch: char,
    },
}

/// A unique, validated provider identifier
///
/// Ordering is lexical, which the selector relies on for deterministic
/// tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    /// Parse and validate a provider identifier
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidProviderId> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidProviderId::Empty);
        }
        if s.chars().count() > MAX_PROVIDER_ID_LEN {
            return Err(InvalidProviderId::TooLong(s));
        }
        if let Some(ch) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(InvalidProviderId::InvalidCharacter { id: s, ch });
        }
        Ok(Self(s))
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProviderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProviderId {
    type Error = InvalidProviderId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = InvalidProviderId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0
    }
}
