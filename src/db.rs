// 💾 SQLite mirror of the queue
//
// The registry stays the source of truth while running. This mirror lets a
// restart pick up where it left off: every change event triggers a full
// rewrite of `queue_entries` from a fresh snapshot, and the event itself is
// appended to `queue_events` as an audit trail.

use crate::api::StationConfig;
use crate::callsign::Callsign;
use crate::notifier::ChangeEvent;
use crate::registry::{Entry, RegistrySnapshot, SlotRegistry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Queue entries (one row per occupied position)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_entries (
            position INTEGER PRIMARY KEY,
            entry_id TEXT UNIQUE NOT NULL,
            callsign TEXT NOT NULL,
            location TEXT,
            comment TEXT,
            entered_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Station header (single row)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS station_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            operator_name TEXT NOT NULL,
            frequency TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Change events (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            seq INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_events_recorded ON queue_events(recorded_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ENTRIES
// ============================================================================

/// Rows that no longer parse (bad callsign, bad timestamp) are skipped.
pub fn load_entries(conn: &Connection) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(
        "SELECT position, entry_id, callsign, location, comment, entered_at
         FROM queue_entries
         ORDER BY position",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    for (position, id, raw_callsign, location, comment, entered_at) in rows {
        let callsign = match Callsign::parse(&raw_callsign) {
            Ok(callsign) => callsign,
            Err(e) => {
                tracing::warn!(
                    position,
                    callsign = %raw_callsign,
                    error = %e,
                    "skipping stored entry"
                );
                continue;
            }
        };
        let Ok(position) = usize::try_from(position) else {
            tracing::warn!(position, "skipping stored entry with negative position");
            continue;
        };
        let entered_at = match DateTime::parse_from_rfc3339(&entered_at) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(position, error = %e, "skipping stored entry with bad timestamp");
                continue;
            }
        };

        entries.push(Entry {
            id,
            position,
            callsign,
            location,
            comment,
            entered_at,
        });
    }

    Ok(entries)
}

/// Replace the mirrored queue with `snapshot` in one transaction.
pub fn replace_entries(conn: &mut Connection, snapshot: &RegistrySnapshot) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM queue_entries", [])?;

    let mut written = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO queue_entries (position, entry_id, callsign, location, comment, entered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for entry in snapshot.occupied() {
            stmt.execute(params![
                entry.position as i64,
                entry.id,
                entry.callsign.as_str(),
                entry.location,
                entry.comment,
                entry.entered_at.to_rfc3339(),
            ])?;
            written += 1;
        }
    }

    tx.commit().context("Failed to commit queue snapshot")?;
    Ok(written)
}

// ============================================================================
// EVENTS
// ============================================================================

pub fn insert_event(conn: &Connection, event: &ChangeEvent) -> Result<()> {
    let event_type = serde_json::to_value(event.kind())?
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    conn.execute(
        "INSERT INTO queue_events (seq, event_type, data, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event.seq() as i64,
            event_type,
            serde_json::to_string(event)?,
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(())
}

pub fn count_events(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue_events", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// STATION HEADER
// ============================================================================

pub fn load_station_config(conn: &Connection) -> Result<Option<StationConfig>> {
    let config = conn
        .query_row(
            "SELECT operator_name, frequency FROM station_config WHERE id = 1",
            [],
            |row| {
                Ok(StationConfig {
                    operator_name: row.get(0)?,
                    frequency: row.get(1)?,
                })
            },
        )
        .optional()?;

    Ok(config)
}

pub fn save_station_config(conn: &Connection, config: &StationConfig) -> Result<()> {
    conn.execute(
        "INSERT INTO station_config (id, operator_name, frequency, updated_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            operator_name = excluded.operator_name,
            frequency = excluded.frequency,
            updated_at = excluded.updated_at",
        params![config.operator_name, config.frequency, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

// ============================================================================
// SNAPSHOT WRITER
// ============================================================================

fn persist(
    conn: &Mutex<Connection>,
    events: &[ChangeEvent],
    snapshot: &RegistrySnapshot,
) -> Result<usize> {
    let mut conn = conn.lock().expect("database lock poisoned");
    for event in events {
        insert_event(&conn, event)?;
    }
    replace_entries(&mut conn, snapshot)
}

/// Record `events` and rewrite the mirror from a fresh snapshot.
async fn write_mirror(
    registry: &SlotRegistry,
    conn: &Arc<Mutex<Connection>>,
    events: Vec<ChangeEvent>,
) -> Result<usize> {
    let snapshot = registry.snapshot();
    let conn = Arc::clone(conn);

    tokio::task::spawn_blocking(move || persist(&conn, &events, &snapshot))
        .await
        .context("queue mirror task panicked")?
}

/// Subscribe to the registry and rewrite the mirror after every change.
///
/// A failed write is logged and repaired by the next event, since each write
/// stores a complete snapshot. On shutdown, queued events are drained and a
/// final snapshot is written before the task ends.
pub fn spawn_snapshot_writer(
    registry: Arc<SlotRegistry>,
    conn: Arc<Mutex<Connection>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut subscription = registry.notifier().subscribe();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let seq = event.seq();
            match write_mirror(&registry, &conn, vec![event]).await {
                Ok(written) => tracing::debug!(seq, written, "queue mirror updated"),
                Err(e) => {
                    tracing::error!(seq, error = %format!("{:#}", e), "queue mirror write failed")
                }
            }
        }

        // Final flush
        registry.notifier().unsubscribe(subscription.id());
        let pending: Vec<ChangeEvent> = std::iter::from_fn(|| subscription.try_recv()).collect();
        let drained = pending.len();

        match write_mirror(&registry, &conn, pending).await {
            Ok(written) => tracing::info!(drained, written, "queue mirror flushed on shutdown"),
            Err(e) => tracing::error!(
                drained,
                error = %format!("{:#}", e),
                "queue mirror final flush failed"
            ),
        }
        tracing::debug!("snapshot writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{ChangeNotifier, RemovalCause};

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn registry() -> Arc<SlotRegistry> {
        Arc::new(SlotRegistry::new(6, Arc::new(ChangeNotifier::new())))
    }

    fn call(raw: &str) -> Callsign {
        Callsign::parse(raw).unwrap()
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = memory_db();
        setup_database(&conn).unwrap();
        assert!(load_entries(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_replace_and_load_entries() {
        let mut conn = memory_db();
        let registry = registry();
        registry.append(call("AB1CD"), Some("Utrecht".into()), None).unwrap();
        registry.append(call("EF2GH"), None, Some("59".into())).unwrap();
        registry.remove(1, RemovalCause::Admin);

        assert_eq!(replace_entries(&mut conn, &registry.snapshot()).unwrap(), 1);

        let loaded = load_entries(&conn).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].position, 2);
        assert_eq!(loaded[0].callsign.as_str(), "EF2GH");
        assert_eq!(loaded[0].comment.as_deref(), Some("59"));

        // Rewriting replaces rather than accumulates
        registry.clear_all();
        assert_eq!(replace_entries(&mut conn, &registry.snapshot()).unwrap(), 0);
        assert!(load_entries(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_corrupt_rows() {
        let conn = memory_db();
        conn.execute(
            "INSERT INTO queue_entries VALUES (1, 'a', 'AB1CD', NULL, NULL, ?1)",
            ["2025-10-18T10:00:00+00:00"],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO queue_entries VALUES (2, 'b', 'bad call!', NULL, NULL, ?1)",
            ["2025-10-18T10:00:00+00:00"],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO queue_entries VALUES (3, 'c', 'EF2GH', NULL, NULL, 'yesterday')",
            [],
        )
        .unwrap();

        let loaded = load_entries(&conn).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].callsign.as_str(), "AB1CD");
    }

    #[test]
    fn test_station_config_round_trip() {
        let conn = memory_db();
        assert_eq!(load_station_config(&conn).unwrap(), None);

        let config = StationConfig {
            operator_name: "PA3EFR".into(),
            frequency: "14.074".into(),
        };
        save_station_config(&conn, &config).unwrap();
        save_station_config(&conn, &config).unwrap();
        assert_eq!(load_station_config(&conn).unwrap(), Some(config));
    }

    #[test]
    fn test_event_log() {
        let conn = memory_db();
        let registry = registry();
        let mut sub = registry.notifier().subscribe();
        registry.append(call("AB1CD"), None, None).unwrap();
        registry.remove(1, RemovalCause::Verified);

        while let Some(event) = sub.try_recv() {
            insert_event(&conn, &event).unwrap();
        }

        assert_eq!(count_events(&conn).unwrap(), 2);
        let kinds: Vec<String> = conn
            .prepare("SELECT event_type FROM queue_events ORDER BY seq")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(kinds, vec!["entry_added", "entry_removed"]);
    }

    #[tokio::test]
    async fn test_snapshot_writer_flushes_on_shutdown() {
        for _ in 0..50 {
            let registry = registry();
            let conn = Arc::new(Mutex::new(memory_db()));
            let shutdown = CancellationToken::new();
            let writer =
                spawn_snapshot_writer(Arc::clone(&registry), Arc::clone(&conn), shutdown.clone());

            registry.append(call("AB1CD"), None, None).unwrap();
            registry.append(call("EF2GH"), None, None).unwrap();
            shutdown.cancel();
            writer.await.unwrap();

            let stored = load_entries(&conn.lock().unwrap()).unwrap();
            assert_eq!(stored.len(), 2, "committed entries missing after shutdown");
            assert_eq!(count_events(&conn.lock().unwrap()).unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_snapshot_writer_follows_registry() {
        let registry = registry();
        let conn = Arc::new(Mutex::new(memory_db()));
        let shutdown = CancellationToken::new();
        let writer =
            spawn_snapshot_writer(Arc::clone(&registry), Arc::clone(&conn), shutdown.clone());

        registry.append(call("AB1CD"), None, None).unwrap();
        registry.append(call("EF2GH"), None, None).unwrap();

        let mut persisted = 0;
        for _ in 0..100 {
            persisted = count_events(&conn.lock().unwrap()).unwrap();
            if persisted == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(persisted, 2);

        let restored = SlotRegistry::restore(
            6,
            load_entries(&conn.lock().unwrap()).unwrap(),
            Arc::new(ChangeNotifier::new()),
        );
        assert_eq!(restored.snapshot().callsign_map(), registry.snapshot().callsign_map());

        shutdown.cancel();
        writer.await.unwrap();
        assert_eq!(registry.notifier().subscriber_count(), 0);
    }
}
