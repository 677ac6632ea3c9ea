// Request / response payloads of the public queue API.
// Transport-agnostic: the axum server serializes these as-is.

use crate::reconciler::ReconcilerStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitRequest {
    pub callsign: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateHeaderRequest {
    pub operator_name: String,
    pub frequency: String,
}

// ============================================================================
// STATION HEADER
// ============================================================================

/// Operator and frequency shown above the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    pub operator_name: String,
    pub frequency: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            operator_name: "QRT for now".to_string(),
            frequency: "---".to_string(),
        }
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Full,
    AlreadyQueued,
    Unauthorized,
    /// Feature needs configuration the server was started without
    NotConfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub state: String,
    pub version: String,
    pub entries_count: usize,
    pub capacity: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciler: Option<ReconcilerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntriesResponse {
    /// position -> callsign, `null` for a free slot
    pub entries: BTreeMap<usize, Option<String>>,
    pub config: StationConfig,
    pub submit_position: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl SubmitResponse {
    pub fn accepted(position: usize, callsign: String) -> Self {
        SubmitResponse {
            success: true,
            position: Some(position),
            callsign: Some(callsign),
            error: None,
            error_kind: None,
        }
    }

    pub fn rejected(kind: ErrorKind, error: String) -> Self {
        SubmitResponse {
            success: false,
            position: None,
            callsign: None,
            error: Some(error),
            error_kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub position: usize,
    /// false when the slot was already empty
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearAllResponse {
    pub success: bool,
    pub count: usize,
}

/// Sent by the external logging script after a contact is logged. The key
/// may also come as a Bearer header.
#[derive(Debug, Clone, Deserialize)]
pub struct ClearCallsignRequest {
    pub callsign: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearCallsignResponse {
    /// false when the callsign was not queued
    pub success: bool,
    pub callsign: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerToggleResponse {
    pub success: bool,
    /// false when the reconciler was already in the requested state
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_kind: ErrorKind,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        ErrorResponse {
            success: false,
            error: error.into(),
            error_kind: kind,
        }
    }
}
