// 🚪 Mutation Gateway - the only door into the registry for request handlers
//
// Validates user input, checks the admin credential, and maps registry
// outcomes to the public API's result types. Change events are published by
// the registry itself as part of each committed mutation.

use crate::api::{EntriesResponse, ErrorKind, StationConfig, StatusResponse};
use crate::callsign::{self, Callsign, ValidationError};
use crate::notifier::RemovalCause;
use crate::reconciler::{ReconcilerControl, ReconcilerStatus};
use crate::registry::{Entry, RegistryError, SlotRegistry};
use chrono::Utc;
use std::sync::{Arc, RwLock};
use thiserror::Error;

const MAX_OPERATOR_LEN: usize = 100;
const MAX_FREQUENCY_LEN: usize = 50;

// ============================================================================
// AUTHORIZATION
// ============================================================================

/// Caller identity as far as the gateway cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Anonymous,
    /// Presented a credential (not yet checked)
    Presenting(String),
}

impl Actor {
    /// Parse an `Authorization: Bearer <secret>` header value.
    pub fn from_authorization(header: Option<&str>) -> Self {
        header
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| Actor::Presenting(token.to_string()))
            .unwrap_or(Actor::Anonymous)
    }
}

/// A shared secret (admin password, logging-script key). With no secret
/// configured every call it guards is rejected.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Option<String>,
}

impl SharedSecret {
    pub fn new(secret: Option<String>) -> Self {
        SharedSecret {
            secret: secret.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn disabled() -> Self {
        SharedSecret { secret: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn authorizes(&self, actor: &Actor) -> bool {
        match (&self.secret, actor) {
            (Some(secret), Actor::Presenting(presented)) => secret == presented,
            _ => false,
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("queue is full (all {capacity} positions taken)")]
    Full { capacity: usize },

    #[error("{callsign} is already in the queue at position {position}")]
    AlreadyQueued { callsign: Callsign, position: usize },

    #[error("valid credential required")]
    Unauthorized,

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::Full { .. } => ErrorKind::Full,
            GatewayError::AlreadyQueued { .. } => ErrorKind::AlreadyQueued,
            GatewayError::Unauthorized => ErrorKind::Unauthorized,
            GatewayError::NotConfigured(_) => ErrorKind::NotConfigured,
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Full { capacity } => GatewayError::Full { capacity },
            RegistryError::AlreadyQueued { callsign, position } => {
                GatewayError::AlreadyQueued { callsign, position }
            }
        }
    }
}

/// Result of a remove-by-callsign from the logging script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallsignRemoval {
    pub callsign: Callsign,
    /// Position it was removed from; `None` when it was not queued
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub position: usize,
    /// false = slot was already empty (no-op success)
    pub removed: bool,
}

// ============================================================================
// GATEWAY
// ============================================================================

pub struct MutationGateway {
    registry: Arc<SlotRegistry>,
    admin: SharedSecret,
    logger: SharedSecret,
    station: RwLock<StationConfig>,
    reconciler: Option<Arc<ReconcilerControl>>,
}

impl MutationGateway {
    pub fn new(registry: Arc<SlotRegistry>, admin: SharedSecret, station: StationConfig) -> Self {
        MutationGateway {
            registry,
            admin,
            logger: SharedSecret::disabled(),
            station: RwLock::new(station),
            reconciler: None,
        }
    }

    /// Key the external logging script presents to remove a callsign
    pub fn with_logger_key(mut self, key: SharedSecret) -> Self {
        self.logger = key;
        self
    }

    /// Report the reconciler's status and allow admins to start/stop it
    pub fn with_reconciler(mut self, control: Arc<ReconcilerControl>) -> Self {
        self.reconciler = Some(control);
        self
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    fn authorize(&self, actor: &Actor, action: &'static str) -> Result<(), GatewayError> {
        check(&self.admin, actor, action)
    }

    fn reconciler_control(&self) -> Result<&Arc<ReconcilerControl>, GatewayError> {
        self.reconciler
            .as_ref()
            .ok_or(GatewayError::NotConfigured("verifier"))
    }

    // ------------------------------------------------------------------------
    // Public
    // ------------------------------------------------------------------------

    pub fn submit(
        &self,
        callsign: &str,
        location: Option<&str>,
        comment: Option<&str>,
    ) -> Result<Entry, GatewayError> {
        let callsign = Callsign::parse(callsign)?;
        let location =
            callsign::normalize_free_text(location, "location", callsign::MAX_LOCATION_LEN)?;
        let comment =
            callsign::normalize_free_text(comment, "comment", callsign::MAX_COMMENT_LEN)?;

        let entry = self.registry.append(callsign, location, comment)?;
        Ok(entry)
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            state: "running".to_string(),
            version: crate::VERSION.to_string(),
            entries_count: self.registry.occupied_count(),
            capacity: self.registry.capacity(),
            timestamp: Utc::now(),
            reconciler: self.reconciler.as_ref().map(|c| c.status().get()),
        }
    }

    pub fn entries(&self) -> EntriesResponse {
        let snapshot = self.registry.snapshot();

        EntriesResponse {
            entries: snapshot.callsign_map(),
            config: self.station(),
            submit_position: snapshot.first_free_position(),
            timestamp: snapshot.taken_at,
        }
    }

    pub fn station(&self) -> StationConfig {
        self.station.read().expect("station lock poisoned").clone()
    }

    // ------------------------------------------------------------------------
    // Logging script
    // ------------------------------------------------------------------------

    /// Remove `callsign` wherever it sits. Not being queued is a success
    /// with no position.
    pub fn remove_callsign(
        &self,
        callsign: &str,
        actor: &Actor,
    ) -> Result<CallsignRemoval, GatewayError> {
        check(&self.logger, actor, "clear_callsign")?;

        let callsign = Callsign::parse(callsign)?;
        let position = self.registry.remove_callsign(&callsign, RemovalCause::Logged);

        Ok(CallsignRemoval { callsign, position })
    }

    // ------------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------------

    pub fn admin_delete(
        &self,
        position: usize,
        actor: &Actor,
    ) -> Result<DeleteOutcome, GatewayError> {
        self.authorize(actor, "delete")?;

        let capacity = self.registry.capacity();
        if position == 0 || position > capacity {
            return Err(ValidationError::PositionOutOfRange { position, capacity }.into());
        }

        let removed = self.registry.remove(position, RemovalCause::Admin);
        Ok(DeleteOutcome { position, removed })
    }

    pub fn admin_clear_all(&self, actor: &Actor) -> Result<usize, GatewayError> {
        self.authorize(actor, "clear_all")?;
        Ok(self.registry.clear_all())
    }

    /// `None` when no verifier is configured
    pub fn reconciler_status(
        &self,
        actor: &Actor,
    ) -> Result<Option<ReconcilerStatus>, GatewayError> {
        self.authorize(actor, "reconciler_status")?;
        Ok(self.reconciler.as_ref().map(|c| c.status().get()))
    }

    /// Returns false if it was already running.
    pub async fn start_reconciler(&self, actor: &Actor) -> Result<bool, GatewayError> {
        self.authorize(actor, "reconciler_start")?;
        let started = self.reconciler_control()?.start().await;
        tracing::info!(started, "reconciler start requested");
        Ok(started)
    }

    /// Returns false if it was not running.
    pub async fn stop_reconciler(&self, actor: &Actor) -> Result<bool, GatewayError> {
        self.authorize(actor, "reconciler_stop")?;
        let stopped = self.reconciler_control()?.stop().await;
        tracing::info!(stopped, "reconciler stop requested");
        Ok(stopped)
    }

    pub fn update_station(
        &self,
        actor: &Actor,
        operator_name: &str,
        frequency: &str,
    ) -> Result<StationConfig, GatewayError> {
        self.authorize(actor, "update_header")?;

        let operator_name = required_text(operator_name, "operator_name", MAX_OPERATOR_LEN)?;
        let frequency = required_text(frequency, "frequency", MAX_FREQUENCY_LEN)?;

        let updated = StationConfig {
            operator_name,
            frequency,
        };
        *self.station.write().expect("station lock poisoned") = updated.clone();

        tracing::info!(
            operator = %updated.operator_name,
            frequency = %updated.frequency,
            "station header updated"
        );
        Ok(updated)
    }
}

fn check(secret: &SharedSecret, actor: &Actor, action: &'static str) -> Result<(), GatewayError> {
    if secret.authorizes(actor) {
        Ok(())
    } else {
        let anonymous = *actor == Actor::Anonymous;
        tracing::warn!(action, anonymous, "unauthorized call");
        Err(GatewayError::Unauthorized)
    }
}

fn required_text(value: &str, field: &'static str, max: usize) -> Result<String, ValidationError> {
    callsign::normalize_free_text(Some(value), field, max)?
        .ok_or(ValidationError::EmptyField { field })
}

// ============================================================================
// TESTS
// ============================================================================
