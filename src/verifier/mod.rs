//! External verification source.
//!
//! The reconciler only sees the [`Verifier`] trait: "which callsigns has the
//! authoritative logbook confirmed (optionally since a given time)?". The
//! QRZ logbook implementation lives in [`qrz`], with its ADIF parsing in
//! [`adif`].

pub mod adif;
pub mod qrz;

use crate::callsign::Callsign;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

pub use qrz::{QrzConfig, QrzLogbookClient};

/// Errors from a verifier fetch. The reconciler handles every kind the same
/// way: abort the cycle, log, try again on the next tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierError {
    #[error("verifier request timed out")]
    Timeout,

    #[error("verifier authentication failed: {0}")]
    AuthFailure(String),

    #[error("verifier response could not be parsed: {0}")]
    ParseFailure(String),

    /// Connection failure or non-success HTTP status
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

impl VerifierError {
    /// Worth retrying within the same cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, VerifierError::Timeout | VerifierError::Unavailable(_))
    }
}

/// Set of confirmed identifiers, normalized to uppercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedSet {
    callsigns: HashSet<String>,
}

impl ConfirmedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, raw: &str) {
        let normalized = raw.trim().to_ascii_uppercase();
        if !normalized.is_empty() {
            self.callsigns.insert(normalized);
        }
    }

    pub fn contains(&self, callsign: &Callsign) -> bool {
        // Callsign is already uppercase
        self.callsigns.contains(callsign.as_str())
    }

    pub fn len(&self) -> usize {
        self.callsigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callsigns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.callsigns.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for ConfirmedSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = ConfirmedSet::new();
        for raw in iter {
            set.insert(raw.as_ref());
        }
        set
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// Short name for logs and status output
    fn name(&self) -> &str;

    /// Fetch every confirmed callsign, optionally limited to confirmations
    /// at or after `since`. Implementations bound their own request time
    /// and exhaust any retries before returning.
    async fn fetch_confirmed(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ConfirmedSet, VerifierError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_set_normalizes() {
        let set: ConfirmedSet = ["ab1cd", " EF2GH ", "", "ab1cd"].into_iter().collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains(&Callsign::parse("AB1CD").unwrap()));
        assert!(set.contains(&Callsign::parse("ef2gh").unwrap()));
        assert!(!set.contains(&Callsign::parse("AB1C").unwrap()));
    }

    #[test]
    fn test_transient_errors() {
        assert!(VerifierError::Timeout.is_transient());
        assert!(VerifierError::Unavailable("502".into()).is_transient());
        assert!(!VerifierError::AuthFailure("bad key".into()).is_transient());
        assert!(!VerifierError::ParseFailure("junk".into()).is_transient());
    }
}
