// End-to-end queue flow: public submits, admin actions and the reconciler
// all writing into one registry, observed through a subscription.

use async_trait::async_trait;
use callsign_queue::notifier::ChangeEvent;
use callsign_queue::{
    Actor, SharedSecret, ChangeKind, ChangeNotifier, ConfirmedSet, CycleOutcome,
    MutationGateway, Reconciler, ReconcilerConfig, RemovalCause, SlotRegistry, StationConfig,
    Verifier, VerifierError,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Logbook whose contents the test controls
#[derive(Default)]
struct FakeLogbook {
    logged: Mutex<Vec<String>>,
}

impl FakeLogbook {
    fn log(&self, callsign: &str) {
        self.logged.lock().unwrap().push(callsign.to_string());
    }
}

#[async_trait]
impl Verifier for FakeLogbook {
    fn name(&self) -> &str {
        "fake-logbook"
    }

    async fn fetch_confirmed(
        &self,
        _since: Option<DateTime<Utc>>,
    ) -> Result<ConfirmedSet, VerifierError> {
        Ok(self.logged.lock().unwrap().iter().collect())
    }
}

fn setup(capacity: usize) -> (Arc<SlotRegistry>, MutationGateway) {
    let registry = Arc::new(SlotRegistry::new(capacity, Arc::new(ChangeNotifier::new())));
    let gateway = MutationGateway::new(
        Arc::clone(&registry),
        SharedSecret::new(Some("s3cret".to_string())),
        StationConfig::default(),
    );
    (registry, gateway)
}

#[tokio::test]
async fn test_confirmed_contact_leaves_the_queue() {
    let (registry, gateway) = setup(4);
    let logbook = Arc::new(FakeLogbook::default());
    let reconciler = Reconciler::new(
        Arc::clone(&registry),
        logbook.clone(),
        ReconcilerConfig::default(),
    );

    gateway.submit("PA3EFR", Some("Utrecht"), None).unwrap();
    gateway.submit("DL1ABC", None, None).unwrap();
    gateway.submit("ON4XYZ", None, Some("QRP")).unwrap();

    let mut sub = registry.notifier().subscribe();

    // Nothing logged yet: nothing removed
    match reconciler.run_cycle().await.unwrap() {
        CycleOutcome::Completed(report) => assert!(report.removed.is_empty()),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(sub.try_recv().is_none());

    // Operator logs DL1ABC (lowercase in the log) plus someone not queued
    logbook.log("dl1abc");
    logbook.log("K1ZZZ");
    reconciler.run_cycle().await.unwrap();

    let event = sub.try_recv().expect("removal event");
    match event {
        ChangeEvent::EntryRemoved {
            position,
            callsign,
            cause,
            ..
        } => {
            assert_eq!(position, 2);
            assert_eq!(callsign.as_str(), "DL1ABC");
            assert_eq!(cause, RemovalCause::Verified);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(sub.try_recv().is_none());

    let entries = gateway.entries();
    assert_eq!(entries.entries[&1].as_deref(), Some("PA3EFR"));
    assert_eq!(entries.entries[&2], None);
    assert_eq!(entries.entries[&3].as_deref(), Some("ON4XYZ"));
    assert_eq!(entries.submit_position, Some(2));

    // Freed position is reused by the next submit
    assert_eq!(gateway.submit("G4AAA", None, None).unwrap().position, 2);

    let status = reconciler.status().get();
    assert_eq!(status.cycles_completed, 2);
    assert_eq!(status.last_removed.len(), 1);
}

#[tokio::test]
async fn test_admin_and_reconciler_interleave() {
    let (registry, gateway) = setup(3);
    let logbook = Arc::new(FakeLogbook::default());
    let reconciler = Reconciler::new(
        Arc::clone(&registry),
        logbook.clone(),
        ReconcilerConfig::default(),
    );
    let admin = Actor::Presenting("s3cret".to_string());

    gateway.submit("PA3EFR", None, None).unwrap();
    gateway.submit("DL1ABC", None, None).unwrap();
    logbook.log("PA3EFR");

    // Admin gets there first
    assert!(gateway.admin_delete(1, &admin).unwrap().removed);

    let mut sub = registry.notifier().subscribe();
    match reconciler.run_cycle().await.unwrap() {
        CycleOutcome::Completed(report) => {
            assert!(report.removed.is_empty());
            assert_eq!(report.confirmed_count, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(sub.try_recv().is_none());

    assert_eq!(gateway.admin_clear_all(&admin).unwrap(), 1);
    assert_eq!(sub.try_recv().map(|e| e.kind()), Some(ChangeKind::AllCleared));

    // Empty queue: the verifier is not consulted
    assert_eq!(reconciler.run_cycle().await.unwrap(), CycleOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_background_reconciler_removes_and_stops() {
    let (registry, gateway) = setup(6);
    let logbook = Arc::new(FakeLogbook::default());
    let config = ReconcilerConfig {
        interval: Duration::from_secs(60),
        ..ReconcilerConfig::default()
    };
    let reconciler = Reconciler::new(Arc::clone(&registry), logbook.clone(), config);

    gateway.submit("PA3EFR", None, None).unwrap();
    let mut sub = registry.notifier().subscribe();

    let shutdown = CancellationToken::new();
    let handle = reconciler.spawn(shutdown.clone());

    // Logged after the first cycle has run; picked up on a later tick
    tokio::time::sleep(Duration::from_secs(5)).await;
    logbook.log("PA3EFR");

    let event = tokio::time::timeout(Duration::from_secs(120), sub.recv())
        .await
        .expect("removal within two intervals")
        .expect("subscription open");
    assert_eq!(event.kind(), ChangeKind::EntryRemoved);
    assert_eq!(registry.occupied_count(), 0);

    let status = handle.status();
    assert!(status.get().running);

    handle.shutdown().await.unwrap();
    assert!(!status.get().running);
}
