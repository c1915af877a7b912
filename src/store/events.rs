//! Event log operations
//!
//! Append-only log of `(broker_id, topic, payload, ts)` with time-bounded
//! and pattern-bounded range queries. Equal timestamps tie-break by rowid,
//! which preserves insertion order within a broker.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::topic::TopicPattern;
use crate::types::Event;

use super::{Store, StoreError};

/// Aggregate store statistics, surfaced by `/context/status` and the hub.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_rows: u64,
    pub bytes: u64,
    pub byte_ceiling: u64,
    pub pruning_active: bool,
    pub last_prune_error: Option<String>,
}

/// A distinct `(broker_id, topic)` pair known to the store.
#[derive(Debug, Clone, Serialize)]
pub struct KnownTopic {
    pub broker_id: String,
    pub topic: String,
    pub last_seen: DateTime<Utc>,
}

fn ts_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn row_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        broker_id: row.get(0)?,
        topic: row.get(1)?,
        payload: row.get(2)?,
        timestamp: millis_ts(row.get(3)?),
        hop: 0,
        generated: false,
        qos: 0,
        retain: false,
    })
}

/// `LIKE` pattern matching a literal topic prefix, with SQL wildcards in the
/// prefix itself escaped.
fn prefix_like(prefix: &str) -> String {
    let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("{escaped}%")
}

impl Store {
    /// Append one event. Constant-time; size is accounted against the byte
    /// budget but never rejects the append (the pruner catches up).
    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (broker_id, topic, payload, ts) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.broker_id,
                event.topic,
                event.payload,
                ts_millis(event.timestamp)
            ],
        )?;
        drop(conn);

        self.add_event_bytes(Self::row_cost(&event.topic, &event.payload));
        Ok(())
    }

    /// Most recent event for a topic, optionally scoped to one broker.
    pub fn get_latest(
        &self,
        broker_id: Option<&str>,
        topic: &str,
    ) -> Result<Option<Event>, StoreError> {
        let conn = self.lock();
        let result = match broker_id {
            Some(b) => conn
                .query_row(
                    "SELECT broker_id, topic, payload, ts FROM events \
                     WHERE broker_id = ?1 AND topic = ?2 \
                     ORDER BY ts DESC, id DESC LIMIT 1",
                    params![b, topic],
                    row_event,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT broker_id, topic, payload, ts FROM events \
                     WHERE topic = ?1 ORDER BY ts DESC, id DESC LIMIT 1",
                    params![topic],
                    row_event,
                )
                .optional()?,
        };
        Ok(result)
    }

    /// Newest-first history for a topic.
    pub fn get_history(
        &self,
        broker_id: Option<&str>,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock();
        let mut out = Vec::new();
        match broker_id {
            Some(b) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT broker_id, topic, payload, ts FROM events \
                     WHERE broker_id = ?1 AND topic = ?2 \
                     ORDER BY ts DESC, id DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![b, topic, limit as i64], row_event)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT broker_id, topic, payload, ts FROM events \
                     WHERE topic = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![topic, limit as i64], row_event)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Time-bounded slice, oldest-first, with an optional MQTT-pattern
    /// filter. The pattern's literal prefix narrows the scan; full wildcard
    /// matching happens on the decoded rows.
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        pattern: Option<&TopicPattern>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        let limit = limit.unwrap_or(10_000) as i64;
        let conn = self.lock();
        let mut out = Vec::new();

        match pattern {
            Some(p) => {
                let like = prefix_like(&p.literal_prefix());
                let mut stmt = conn.prepare_cached(
                    "SELECT broker_id, topic, payload, ts FROM events \
                     WHERE ts >= ?1 AND ts <= ?2 AND topic LIKE ?3 ESCAPE '\\' \
                     ORDER BY ts ASC, id ASC",
                )?;
                let rows =
                    stmt.query_map(params![ts_millis(start), ts_millis(end), like], row_event)?;
                for row in rows {
                    let event = row?;
                    if p.matches(&event.topic) {
                        out.push(event);
                        if out.len() as i64 >= limit {
                            break;
                        }
                    }
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT broker_id, topic, payload, ts FROM events \
                     WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts ASC, id ASC LIMIT ?3",
                )?;
                let rows =
                    stmt.query_map(params![ts_millis(start), ts_millis(end), limit], row_event)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Substring match on topic or payload. Rejects queries shorter than
    /// two characters.
    pub fn search_fulltext(
        &self,
        q: &str,
        broker_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        if q.chars().count() < 2 {
            return Err(StoreError::QueryTooShort);
        }

        let needle = format!(
            "%{}%",
            q.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let start_ms = start.map_or(i64::MIN, ts_millis);
        let end_ms = end.map_or(i64::MAX, ts_millis);

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT broker_id, topic, payload, ts FROM events \
             WHERE ts >= ?1 AND ts <= ?2 \
             AND (?3 IS NULL OR broker_id = ?3) \
             AND (topic LIKE ?4 ESCAPE '\\' OR CAST(payload AS TEXT) LIKE ?4 ESCAPE '\\') \
             ORDER BY ts DESC, id DESC LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![start_ms, end_ms, broker_id, needle, limit as i64],
            row_event,
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// MQTT-pattern match plus per-key equality filters over the decoded
    /// payload. Newest-first.
    pub fn search_by_template(
        &self,
        pattern: &TopicPattern,
        filters: &serde_json::Map<String, serde_json::Value>,
        broker_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let like = prefix_like(&pattern.literal_prefix());

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT broker_id, topic, payload, ts FROM events \
             WHERE topic LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR broker_id = ?2) \
             ORDER BY ts DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![like, broker_id], row_event)?;

        let mut out = Vec::new();
        for row in rows {
            let event = row?;
            if !pattern.matches(&event.topic) {
                continue;
            }
            if !filters.is_empty() {
                let decoded = event.decode_payload().to_json();
                let matches_all = filters
                    .iter()
                    .all(|(key, expected)| decoded.get(key) == Some(expected));
                if !matches_all {
                    continue;
                }
            }
            out.push(event);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Delete all events whose topic matches the pattern. Returns the count.
    pub fn prune_pattern(
        &self,
        pattern: &TopicPattern,
        broker_id: Option<&str>,
    ) -> Result<usize, StoreError> {
        let like = prefix_like(&pattern.literal_prefix());
        let conn = self.lock();

        let mut stmt = conn.prepare(
            "SELECT id, topic, LENGTH(topic) + LENGTH(payload) FROM events \
             WHERE topic LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR broker_id = ?2)",
        )?;
        let candidates: Vec<(i64, String, i64)> = stmt
            .query_map(params![like, broker_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut deleted = 0usize;
        let mut freed = 0i64;
        for (id, topic, size) in candidates {
            if pattern.matches(&topic) {
                conn.execute("DELETE FROM events WHERE id = ?1", [id])?;
                deleted += 1;
                freed += size + super::ROW_OVERHEAD;
            }
        }
        drop(conn);

        self.add_event_bytes(-freed);
        Ok(deleted)
    }

    /// Most recent events across all topics, newest-first. Backs the hub's
    /// initial batch.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT broker_id, topic, payload, ts FROM events \
             ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Distinct `(broker_id, topic)` pairs, most recently seen first.
    pub fn distinct_topics(&self, limit: usize) -> Result<Vec<KnownTopic>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT broker_id, topic, MAX(ts) FROM events \
             GROUP BY broker_id, topic ORDER BY MAX(ts) DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(KnownTopic {
                broker_id: row.get(0)?,
                topic: row.get(1)?,
                last_seen: millis_ts(row.get(2)?),
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let total_rows: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

        Ok(StoreStats {
            total_rows: total_rows.max(0) as u64,
            bytes: self.event_bytes(),
            byte_ceiling: self.byte_ceiling(),
            pruning_active: self.pruning_active(),
            last_prune_error: self.last_prune_error(),
        })
    }

    /// Delete the `count` oldest events. Returns (rows deleted, bytes freed).
    /// Used by the retention pruner.
    pub fn delete_oldest(&self, count: usize) -> Result<(usize, i64), StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, LENGTH(topic) + LENGTH(payload) FROM events \
             ORDER BY ts ASC, id ASC LIMIT ?1",
        )?;
        let victims: Vec<(i64, i64)> = stmt
            .query_map([count as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut freed = 0i64;
        for (id, size) in &victims {
            conn.execute("DELETE FROM events WHERE id = ?1", [*id])?;
            freed += size + super::ROW_OVERHEAD;
        }
        drop(conn);

        self.add_event_bytes(-freed);
        Ok((victims.len(), freed))
    }
}
