// 📣 Change Notifier - fan-out of registry mutations to subscribers
//
// Publish is fire-and-forget. Each subscriber owns an unbounded FIFO, so a
// subscriber sees events in the order they were published. The registry
// publishes from inside its write lock, which makes that order the commit
// order.
//
// Clients also poll the full entry list, so a missed event is a latency
// problem, never a correctness problem.

use crate::callsign::Callsign;
use crate::registry::Entry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    EntryAdded,
    EntryRemoved,
    AllCleared,
}

/// Who removed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalCause {
    /// Explicit admin delete
    Admin,
    /// Reconciler matched a confirmation from the verifier
    Verified,
    /// External logging script reported the contact
    Logged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    EntryAdded {
        seq: u64,
        entry: Entry,
    },
    EntryRemoved {
        seq: u64,
        position: usize,
        callsign: Callsign,
        cause: RemovalCause,
        at: DateTime<Utc>,
    },
    AllCleared {
        seq: u64,
        count: usize,
        at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::EntryAdded { .. } => ChangeKind::EntryAdded,
            ChangeEvent::EntryRemoved { .. } => ChangeKind::EntryRemoved,
            ChangeEvent::AllCleared { .. } => ChangeKind::AllCleared,
        }
    }

    /// Commit sequence number assigned by the registry
    pub fn seq(&self) -> u64 {
        match self {
            ChangeEvent::EntryAdded { seq, .. }
            | ChangeEvent::EntryRemoved { seq, .. }
            | ChangeEvent::AllCleared { seq, .. } => *seq,
        }
    }
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving end of a subscription. Dropping it is an implicit unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, for draining in tests and sync callers.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

#[derive(Default)]
pub struct ChangeNotifier {
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<ChangeEvent>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = SubscriptionId(Uuid::new_v4());

        self.subscribers
            .lock()
            .expect("notifier lock poisoned")
            .insert(id, sender);
        tracing::debug!(subscription = %id, "subscriber added");

        Subscription { id, receiver }
    }

    /// Returns false when the id was not (or no longer) subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscribers
            .lock()
            .expect("notifier lock poisoned")
            .remove(&id)
            .is_some();
        if removed {
            tracing::debug!(subscription = %id, "subscriber removed");
        }
        removed
    }

    /// Deliver to every live subscriber; returns how many received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut subscribers = self.subscribers.lock().expect("notifier lock poisoned");

        subscribers.retain(|_, sender| sender.send(event.clone()).is_ok());

        tracing::trace!(
            kind = ?event.kind(),
            seq = event.seq(),
            delivered = subscribers.len(),
            "change event published"
        );
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("notifier lock poisoned").len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cleared(seq: u64, count: usize) -> ChangeEvent {
        ChangeEvent::AllCleared {
            seq,
            count,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let notifier = ChangeNotifier::new();
        assert_eq!(notifier.publish(cleared(1, 3)), 0);
    }

    #[test]
    fn test_fan_out_preserves_order_per_subscriber() {
        let notifier = ChangeNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        for seq in 1..=5 {
            assert_eq!(notifier.publish(cleared(seq, 1)), 2);
        }

        for sub in [&mut first, &mut second] {
            let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
                .map(|e| e.seq())
                .collect();
            assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let notifier = ChangeNotifier::new();
        let mut sub = notifier.subscribe();
        let id = sub.id();

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));

        notifier.publish(cleared(1, 1));
        assert!(sub.try_recv().is_none());
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let notifier = ChangeNotifier::new();
        let sub = notifier.subscribe();
        let _kept = notifier.subscribe();
        drop(sub);

        assert_eq!(notifier.publish(cleared(1, 1)), 1);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(cleared(7, 4)).unwrap();
        assert_eq!(json["event"], "all_cleared");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["count"], 4);
    }
}
