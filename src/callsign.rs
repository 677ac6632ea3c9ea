// 📻 Callsign - validated, normalized identifier for a queue entry
//
// "ab1/p" → "AB1/P"
//
// Every Entry holds a Callsign, so an occupied slot can never carry an
// empty or malformed identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_CALLSIGN_LEN: usize = 3;
pub const MAX_CALLSIGN_LEN: usize = 20;
pub const MAX_LOCATION_LEN: usize = 100;
pub const MAX_COMMENT_LEN: usize = 500;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("callsign is required")]
    EmptyCallsign,

    #[error("callsign too short (minimum {min} characters, got {len})")]
    CallsignTooShort { min: usize, len: usize },

    #[error("callsign too long (maximum {max} characters, got {len})")]
    CallsignTooLong { max: usize, len: usize },

    #[error("invalid character {0:?} in callsign (allowed: A-Z, 0-9, '/', '-')")]
    InvalidCharacter(char),

    #[error("{field} too long (maximum {max} characters)")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid position {position} (valid range 1-{capacity})")]
    PositionOutOfRange { position: usize, capacity: usize },
}

// ============================================================================
// CALLSIGN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign(String);

impl Callsign {
    /// Trim, uppercase and validate a raw callsign.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_ascii_uppercase();

        if normalized.is_empty() {
            return Err(ValidationError::EmptyCallsign);
        }

        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '/' || *c == '-'))
        {
            return Err(ValidationError::InvalidCharacter(bad));
        }

        // Charset is ASCII from here on, so byte length == char count
        let len = normalized.len();
        if len < MIN_CALLSIGN_LEN {
            return Err(ValidationError::CallsignTooShort {
                min: MIN_CALLSIGN_LEN,
                len,
            });
        }
        if len > MAX_CALLSIGN_LEN {
            return Err(ValidationError::CallsignTooLong {
                max: MAX_CALLSIGN_LEN,
                len,
            });
        }

        Ok(Callsign(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive exact comparison against an external identifier
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Callsign {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Callsign::parse(s)
    }
}

impl TryFrom<String> for Callsign {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Callsign::parse(&value)
    }
}

impl From<Callsign> for String {
    fn from(callsign: Callsign) -> Self {
        callsign.0
    }
}

impl AsRef<str> for Callsign {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// FREE-TEXT FIELDS
// ============================================================================

/// Normalize an optional free-text field: trimmed, blank becomes `None`.
pub fn normalize_free_text(
    value: Option<&str>,
    field: &'static str,
    max: usize,
) -> Result<Option<String>, ValidationError> {
    let Some(trimmed) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    if trimmed.chars().count() > max {
        return Err(ValidationError::FieldTooLong { field, max });
    }

    Ok(Some(trimmed.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
