//! Event store over the K/V adapter.
//!
//! One hash per event under `event:{event_id}`, expiring after the configured
//! TTL regardless of terminal state. All writes are single-key; concurrency
//! safety comes from the store's own atomicity.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{Event, EventSource, EventStatus};
use crate::kv::Kv;

fn event_key(event_id: &str) -> String {
    format!("event:{}", event_id)
}

pub struct EventStore {
    kv: Arc<dyn Kv>,
    ttl_secs: u64,
}

impl EventStore {
    pub fn new(kv: Arc<dyn Kv>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    /// Stage a fresh event with `status=queued, attempts=0` and apply the TTL.
    /// Returns the full record, including the server-generated event id.
    pub async fn store(
        &self,
        source: EventSource,
        event_type: &str,
        external_id: &str,
        idempotency_key: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<Event> {
        let event_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let payload_json = serde_json::to_string(payload)?;

        let key = event_key(&event_id);
        self.kv
            .hset(
                &key,
                &[
                    ("id", event_id.clone()),
                    ("source", source.as_str().to_string()),
                    ("event_type", event_type.to_string()),
                    ("external_id", external_id.to_string()),
                    ("idempotency_key", idempotency_key.to_string()),
                    ("payload_json", payload_json),
                    ("status", EventStatus::Queued.as_str().to_string()),
                    ("attempts", "0".to_string()),
                    ("last_error", String::new()),
                    ("created_at", now.to_rfc3339()),
                    ("updated_at", now.to_rfc3339()),
                ],
            )
            .await?;
        self.kv.expire(&key, self.ttl_secs).await?;

        Ok(Event {
            event_id,
            source,
            event_type: event_type.to_string(),
            external_id: external_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            status: EventStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            payload: payload.clone(),
        })
    }

    /// Load an event. Returns `None` when the record is absent (TTL expired or
    /// never staged).
    pub async fn load(&self, event_id: &str) -> anyhow::Result<Option<Event>> {
        let fields = self.kv.hgetall(&event_key(event_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields_to_event(event_id, fields)))
    }

    /// Single-key status update; prior fields are preserved. `last_error` is
    /// only written when provided so a later success does not erase history.
    pub async fn set_status(
        &self,
        event_id: &str,
        status: EventStatus,
        last_error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut fields: Vec<(&str, String)> = vec![
            ("status", status.as_str().to_string()),
            ("updated_at", Utc::now().to_rfc3339()),
        ];
        if let Some(err) = last_error {
            fields.push(("last_error", err.to_string()));
        }
        self.kv.hset(&event_key(event_id), &fields).await
    }

    /// Increment the authoritative attempt counter, returning the new value.
    pub async fn increment_attempts(&self, event_id: &str) -> anyhow::Result<i64> {
        self.kv.hincr(&event_key(event_id), "attempts", 1).await
    }

    /// Remove a staged record (used when staging loses the idempotency race).
    pub async fn delete(&self, event_id: &str) -> anyhow::Result<()> {
        self.kv.del(&event_key(event_id)).await
    }
}

fn fields_to_event(event_id: &str, fields: HashMap<String, String>) -> Event {
    let get = |f: &str| fields.get(f).cloned().unwrap_or_default();

    let payload = serde_json::from_str(&get("payload_json")).unwrap_or_else(|e| {
        warn!(event_id, error = %e, "Stored payload is not valid JSON");
        serde_json::Value::Null
    });
    let parse_ts = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };

    let source = EventSource::from_str(&get("source")).unwrap_or(EventSource::ManualEnrich);
    let status = EventStatus::from_str(&get("status")).unwrap_or(EventStatus::Queued);
    let last_error = {
        let raw = get("last_error");
        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    };

    Event {
        event_id: event_id.to_string(),
        source,
        event_type: get("event_type"),
        external_id: get("external_id"),
        idempotency_key: get("idempotency_key"),
        status,
        attempts: get("attempts").parse().unwrap_or(0),
        last_error,
        created_at: parse_ts(get("created_at")),
        updated_at: parse_ts(get("updated_at")),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn store_with_memory() -> (EventStore, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (EventStore::new(kv.clone(), 2_592_000), kv)
    }

    #[tokio::test]
    async fn store_and_load_roundtrip() {
        let (store, _kv) = store_with_memory();
        let payload = json!({"event": "booked", "payload": {"email": "a@b.com"}});
        let ev = store
            .store(
                EventSource::Calendar,
                "booked",
                "evt-123",
                "calendar:booked:evt-123",
                &payload,
            )
            .await
            .unwrap();

        let loaded = store.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.source, EventSource::Calendar);
        assert_eq!(loaded.event_type, "booked");
        assert_eq!(loaded.external_id, "evt-123");
        assert_eq!(loaded.status, EventStatus::Queued);
        assert_eq!(loaded.attempts, 0);
        assert_eq!(loaded.last_error, None);
        assert_eq!(loaded.payload, payload);
    }

    #[tokio::test]
    async fn missing_event_loads_as_none() {
        let (store, _kv) = store_with_memory();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_is_applied_to_event_key() {
        let (store, kv) = store_with_memory();
        let ev = store
            .store(
                EventSource::SupportTag,
                "tag_added",
                "c1:0",
                "support_tag:tag_added:c1:0",
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(kv.recorded_ttl(&format!("event:{}", ev.event_id)), Some(2_592_000));
    }

    #[tokio::test]
    async fn status_updates_preserve_last_error() {
        let (store, _kv) = store_with_memory();
        let ev = store
            .store(
                EventSource::Calendar,
                "booked",
                "e",
                "calendar:booked:e",
                &json!({}),
            )
            .await
            .unwrap();

        store
            .set_status(&ev.event_id, EventStatus::Queued, Some("CRM HTTP 429"))
            .await
            .unwrap();
        store
            .set_status(&ev.event_id, EventStatus::Processing, None)
            .await
            .unwrap();

        let loaded = store.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Processing);
        assert_eq!(loaded.last_error.as_deref(), Some("CRM HTTP 429"));
    }

    #[tokio::test]
    async fn attempts_counter_is_monotonic() {
        let (store, _kv) = store_with_memory();
        let ev = store
            .store(
                EventSource::Calendar,
                "booked",
                "e",
                "calendar:booked:e",
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(store.increment_attempts(&ev.event_id).await.unwrap(), 1);
        assert_eq!(store.increment_attempts(&ev.event_id).await.unwrap(), 2);
        let loaded = store.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts, 2);
    }
}
