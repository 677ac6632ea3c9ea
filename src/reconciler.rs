// ⚖️ Reconciler - remove queued callsigns once the logbook confirms them
//
// One cycle:
//   Idle -> Fetching -> Matching -> Applying -> Idle
//
// Fetching talks to the verifier with no registry lock held. Matching works
// on a snapshot. Applying removes each matched slot through the registry's
// normal mutation path, so it serializes with user and admin writes like
// any other caller. A slot that changed since the snapshot is skipped.
//
// Any verifier failure aborts the cycle without touching the registry; the
// next tick simply tries again.

use crate::callsign::Callsign;
use crate::notifier::RemovalCause;
use crate::registry::SlotRegistry;
use crate::verifier::{ConfirmedSet, Verifier, VerifierError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Which confirmations count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationWindow {
    /// Only contacts logged since 00:00 UTC today
    #[default]
    Today,
    /// Anything in the logbook
    AllTime,
}

impl ConfirmationWindow {
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ConfirmationWindow::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc()),
            ConfirmationWindow::AllTime => None,
        }
    }
}

impl FromStr for ConfirmationWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(ConfirmationWindow::Today),
            "all" | "all_time" => Ok(ConfirmationWindow::AllTime),
            other => Err(format!("unknown confirmation window {:?} (expected today|all)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between cycle starts
    pub interval: Duration,
    /// Upper bound on one verifier fetch, retries included
    pub cycle_budget: Duration,
    pub window: ConfirmationWindow,
    /// Skip the verifier call when nothing is queued
    pub skip_when_empty: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            interval: Duration::from_secs(60),
            cycle_budget: Duration::from_secs(30),
            window: ConfirmationWindow::Today,
            skip_when_empty: true,
        }
    }
}

// ============================================================================
// CYCLE RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerPhase {
    Idle,
    Fetching,
    Matching,
    Applying,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedEntry {
    pub position: usize,
    pub callsign: Callsign,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub confirmed_count: usize,
    pub removed: Vec<RemovedEntry>,
    /// Matched in the snapshot but vacated or refilled before removal
    pub already_gone: Vec<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        format!(
            "{} confirmed, {} removed, {} already gone",
            self.confirmed_count,
            self.removed.len(),
            self.already_gone.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Registry was empty; the verifier was not called
    Skipped,
    Completed(CycleReport),
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcilerStatus {
    pub running: bool,
    pub phase: ReconcilerPhase,
    pub verifier: String,
    pub interval_secs: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_removed: Vec<Callsign>,
}

/// Shared, read-only view of a reconciler's status
#[derive(Clone)]
pub struct StatusHandle(Arc<RwLock<ReconcilerStatus>>);

impl StatusHandle {
    pub fn get(&self) -> ReconcilerStatus {
        self.0.read().expect("status lock poisoned").clone()
    }

    fn update(&self, f: impl FnOnce(&mut ReconcilerStatus)) {
        f(&mut self.0.write().expect("status lock poisoned"));
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct Reconciler {
    registry: Arc<SlotRegistry>,
    verifier: Arc<dyn Verifier>,
    config: ReconcilerConfig,
    status: StatusHandle,
}

impl Reconciler {
    pub fn new(
        registry: Arc<SlotRegistry>,
        verifier: Arc<dyn Verifier>,
        config: ReconcilerConfig,
    ) -> Self {
        let status = ReconcilerStatus {
            running: false,
            phase: ReconcilerPhase::Idle,
            verifier: verifier.name().to_string(),
            interval_secs: config.interval.as_secs(),
            cycles_completed: 0,
            cycles_failed: 0,
            cycles_skipped: 0,
            last_cycle_at: None,
            last_error: None,
            last_removed: Vec::new(),
        };

        Reconciler {
            registry,
            verifier,
            config,
            status: StatusHandle(Arc::new(RwLock::new(status))),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    fn set_phase(&self, phase: ReconcilerPhase) {
        self.status.update(|s| s.phase = phase);
    }

    /// One fetch-match-apply pass.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, VerifierError> {
        let started_at = Utc::now();

        if self.config.skip_when_empty && self.registry.occupied_count() == 0 {
            tracing::debug!("registry empty, skipping reconciliation cycle");
            self.status.update(|s| {
                s.cycles_skipped += 1;
                s.last_cycle_at = Some(started_at);
            });
            return Ok(CycleOutcome::Skipped);
        }

        // Fetching
        self.set_phase(ReconcilerPhase::Fetching);
        let confirmed = match self.fetch(started_at).await {
            Ok(confirmed) => confirmed,
            Err(err) => {
                tracing::warn!(
                    verifier = self.verifier.name(),
                    error = %err,
                    "reconciliation cycle aborted"
                );
                self.status.update(|s| {
                    s.phase = ReconcilerPhase::Idle;
                    s.cycles_failed += 1;
                    s.last_cycle_at = Some(started_at);
                    s.last_error = Some(err.to_string());
                });
                return Err(err);
            }
        };

        // Matching
        self.set_phase(ReconcilerPhase::Matching);
        let snapshot = self.registry.snapshot();
        let matched: Vec<_> = snapshot
            .occupied()
            .filter(|entry| confirmed.contains(&entry.callsign))
            .collect();

        // Applying
        self.set_phase(ReconcilerPhase::Applying);
        let mut removed = Vec::new();
        let mut already_gone = Vec::new();
        for entry in matched {
            if self
                .registry
                .remove_if_current(entry.position, &entry.id, RemovalCause::Verified)
            {
                removed.push(RemovedEntry {
                    position: entry.position,
                    callsign: entry.callsign.clone(),
                });
            } else {
                already_gone.push(entry.position);
            }
        }

        let report = CycleReport {
            confirmed_count: confirmed.len(),
            removed,
            already_gone,
            started_at,
            finished_at: Utc::now(),
        };

        if report.removed.is_empty() {
            tracing::debug!(summary = %report.summary(), "reconciliation cycle complete");
        } else {
            tracing::info!(summary = %report.summary(), "reconciliation cycle complete");
        }

        self.status.update(|s| {
            s.phase = ReconcilerPhase::Idle;
            s.cycles_completed += 1;
            s.last_cycle_at = Some(started_at);
            s.last_error = None;
            s.last_removed = report.removed.iter().map(|r| r.callsign.clone()).collect();
        });

        Ok(CycleOutcome::Completed(report))
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<ConfirmedSet, VerifierError> {
        let since = self.config.window.since(now);
        match tokio::time::timeout(self.config.cycle_budget, self.verifier.fetch_confirmed(since))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(VerifierError::Timeout),
        }
    }

    /// Run cycles on the configured interval until `shutdown` fires.
    /// Shutdown is only observed between cycles.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.status.update(|s| s.running = true);
        tracing::info!(
            verifier = self.verifier.name(),
            interval_secs = self.config.interval.as_secs(),
            window = ?self.config.window,
            "reconciler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Failures are logged and recorded in status by run_cycle
            let _ = self.run_cycle().await;
        }

        self.status.update(|s| {
            s.running = false;
            s.phase = ReconcilerPhase::Idle;
        });
        tracing::info!("reconciler stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> ReconcilerHandle {
        let status = self.status();
        let join = tokio::spawn(self.run(shutdown.clone()));

        ReconcilerHandle {
            status,
            shutdown,
            join,
        }
    }
}

pub struct ReconcilerHandle {
    status: StatusHandle,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request a stop and wait for the current cycle (if any) to finish.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.shutdown.cancel();
        self.join.await
    }
}

// ============================================================================
// RUNTIME CONTROL
// ============================================================================

/// Starts and stops the background reconciler on demand. Counters in the
/// shared status survive a stop/start.
pub struct ReconcilerControl {
    registry: Arc<SlotRegistry>,
    verifier: Arc<dyn Verifier>,
    config: ReconcilerConfig,
    status: StatusHandle,
    /// Parent of every run's token; cancelling it stops the current run
    shutdown: CancellationToken,
    current: tokio::sync::Mutex<Option<ReconcilerHandle>>,
}

impl ReconcilerControl {
    pub fn new(
        registry: Arc<SlotRegistry>,
        verifier: Arc<dyn Verifier>,
        config: ReconcilerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let status = Reconciler::new(Arc::clone(&registry), Arc::clone(&verifier), config.clone())
            .status();

        ReconcilerControl {
            registry,
            verifier,
            config,
            status,
            shutdown,
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn a run. Returns false if one is already going.
    pub async fn start(&self) -> bool {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let reconciler = Reconciler {
            registry: Arc::clone(&self.registry),
            verifier: Arc::clone(&self.verifier),
            config: self.config.clone(),
            status: self.status.clone(),
        };
        *current = Some(reconciler.spawn(self.shutdown.child_token()));
        true
    }

    /// Stop the current run, waiting for an in-flight cycle. Returns false
    /// if nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(handle) = self.current.lock().await.take() else {
            return false;
        };
        let was_running = !handle.is_finished();

        if let Err(e) = handle.shutdown().await {
            tracing::error!(error = %e, "reconciler task failed");
        }
        was_running
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{ChangeEvent, ChangeKind, ChangeNotifier};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedVerifier {
        responses: Mutex<VecDeque<Result<ConfirmedSet, VerifierError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedVerifier {
        fn new(responses: Vec<Result<ConfirmedSet, VerifierError>>) -> Arc<Self> {
            Arc::new(ScriptedVerifier {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Verifier for ScriptedVerifier {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_confirmed(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<ConfirmedSet, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ConfirmedSet::new()))
        }
    }

    struct HangingVerifier;

    #[async_trait]
    impl Verifier for HangingVerifier {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn fetch_confirmed(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<ConfirmedSet, VerifierError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ConfirmedSet::new())
        }
    }

    fn confirmed(calls: &[&str]) -> Result<ConfirmedSet, VerifierError> {
        Ok(calls.iter().collect())
    }

    fn seeded_registry(calls: &[&str]) -> Arc<SlotRegistry> {
        let registry = Arc::new(SlotRegistry::new(6, Arc::new(ChangeNotifier::new())));
        for raw in calls {
            registry
                .append(Callsign::parse(raw).unwrap(), None, None)
                .unwrap();
        }
        registry
    }

    fn reconciler(registry: &Arc<SlotRegistry>, verifier: Arc<dyn Verifier>) -> Reconciler {
        Reconciler::new(Arc::clone(registry), verifier, ReconcilerConfig::default())
    }

    #[tokio::test]
    async fn test_cycle_removes_only_confirmed_entries() {
        let registry = seeded_registry(&["AB1CD", "EF2GH"]);
        let mut sub = registry.notifier().subscribe();
        let verifier = ScriptedVerifier::new(vec![confirmed(&["AB1CD"])]);
        let reconciler = reconciler(&registry, verifier.clone());

        let outcome = reconciler.run_cycle().await.unwrap();

        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.removed[0].position, 1);

        let map = registry.snapshot().callsign_map();
        assert_eq!(map[&1], None);
        assert_eq!(map[&2], Some("EF2GH".to_string()));

        let events: Vec<ChangeEvent> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), ChangeKind::EntryRemoved);
        assert!(matches!(
            events[0],
            ChangeEvent::EntryRemoved {
                position: 1,
                cause: RemovalCause::Verified,
                ..
            }
        ));

        let status = reconciler.status().get();
        assert_eq!(status.cycles_completed, 1);
        assert_eq!(status.phase, ReconcilerPhase::Idle);
        assert_eq!(status.last_removed, vec![Callsign::parse("AB1CD").unwrap()]);
    }

    #[tokio::test]
    async fn test_match_is_case_insensitive() {
        let registry = seeded_registry(&["ab1/p"]);
        let verifier = ScriptedVerifier::new(vec![confirmed(&["Ab1/p"])]);

        reconciler(&registry, verifier).run_cycle().await.unwrap();
        assert_eq!(registry.occupied_count(), 0);
    }

    #[tokio::test]
    async fn test_verifier_failure_leaves_registry_untouched() {
        let registry = seeded_registry(&["AB1CD", "EF2GH"]);
        let before = registry.snapshot().slots;
        let mut sub = registry.notifier().subscribe();
        let verifier = ScriptedVerifier::new(vec![Err(VerifierError::Timeout)]);
        let reconciler = reconciler(&registry, verifier);

        let err = reconciler.run_cycle().await.unwrap_err();
        assert_eq!(err, VerifierError::Timeout);

        assert_eq!(registry.snapshot().slots, before);
        assert!(sub.try_recv().is_none());

        let status = reconciler.status().get();
        assert_eq!(status.cycles_failed, 1);
        assert_eq!(status.phase, ReconcilerPhase::Idle);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_every_error_kind_aborts_the_same_way() {
        for err in [
            VerifierError::AuthFailure("bad key".into()),
            VerifierError::ParseFailure("junk".into()),
            VerifierError::Unavailable("HTTP 503".into()),
        ] {
            let registry = seeded_registry(&["AB1CD"]);
            let verifier = ScriptedVerifier::new(vec![Err(err.clone())]);

            let result = reconciler(&registry, verifier).run_cycle().await;
            assert_eq!(result, Err(err));
            assert_eq!(registry.occupied_count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_verifier_is_cut_off_by_cycle_budget() {
        let registry = seeded_registry(&["AB1CD"]);
        let reconciler = reconciler(&registry, Arc::new(HangingVerifier));

        let err = reconciler.run_cycle().await.unwrap_err();
        assert_eq!(err, VerifierError::Timeout);
        assert_eq!(registry.occupied_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_skips_fetch() {
        let registry = seeded_registry(&[]);
        let verifier = ScriptedVerifier::new(vec![]);
        let reconciler = reconciler(&registry, verifier.clone());

        assert_eq!(reconciler.run_cycle().await, Ok(CycleOutcome::Skipped));
        assert_eq!(verifier.calls(), 0);
        assert_eq!(reconciler.status().get().cycles_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_is_retried_on_next_tick() {
        let registry = seeded_registry(&["AB1CD", "EF2GH"]);
        let verifier = ScriptedVerifier::new(vec![
            Err(VerifierError::Timeout),
            confirmed(&["AB1CD"]),
        ]);
        let handle = reconciler(&registry, verifier.clone()).spawn(CancellationToken::new());

        // First tick fires immediately, the second one 60s later
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(verifier.calls(), 2);
        let status = handle.status().get();
        assert!(status.running);
        assert_eq!(status.cycles_failed, 1);
        assert_eq!(status.cycles_completed, 1);
        assert_eq!(registry.snapshot().callsign_map()[&1], None);

        let status_handle = handle.status();
        handle.shutdown().await.unwrap();
        assert!(!status_handle.get().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_tick_runs_no_cycle() {
        let registry = seeded_registry(&["AB1CD"]);
        let verifier = ScriptedVerifier::new(vec![]);
        let token = CancellationToken::new();
        token.cancel();

        reconciler(&registry, verifier.clone()).run(token).await;
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_start_stop_keeps_counters() {
        let registry = seeded_registry(&["AB1CD"]);
        let verifier = ScriptedVerifier::new(vec![]);
        let control = ReconcilerControl::new(
            Arc::clone(&registry),
            verifier.clone(),
            ReconcilerConfig::default(),
            CancellationToken::new(),
        );

        assert!(!control.is_running().await);
        assert!(!control.stop().await);

        assert!(control.start().await);
        assert!(!control.start().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(control.is_running().await);
        assert!(control.status().get().running);

        assert!(control.stop().await);
        assert!(!control.is_running().await);
        assert!(!control.status().get().running);
        assert_eq!(verifier.calls(), 1);

        // A fresh run reuses the same status
        assert!(control.start().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(control.status().get().cycles_completed, 2);
        assert!(control.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_follows_parent_shutdown() {
        let registry = seeded_registry(&["AB1CD"]);
        let parent = CancellationToken::new();
        let control = ReconcilerControl::new(
            registry,
            ScriptedVerifier::new(vec![]),
            ReconcilerConfig::default(),
            parent.clone(),
        );

        assert!(control.start().await);
        parent.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!control.is_running().await);
    }

    #[test]
    fn test_confirmation_window() {
        let now = DateTime::parse_from_rfc3339("2025-10-18T14:32:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let since = ConfirmationWindow::Today.since(now).unwrap();
        assert_eq!(since.to_rfc3339(), "2025-10-18T00:00:00+00:00");
        assert_eq!(ConfirmationWindow::AllTime.since(now), None);

        assert_eq!("today".parse::<ConfirmationWindow>(), Ok(ConfirmationWindow::Today));
        assert_eq!("ALL".parse::<ConfirmationWindow>(), Ok(ConfirmationWindow::AllTime));
        assert!("weekly".parse::<ConfirmationWindow>().is_err());
    }
}
