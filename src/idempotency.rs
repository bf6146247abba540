//! Idempotency guard: one logical record, two physical keys.
//!
//! `event_by_idem:{key}` is claimed with an atomic set-if-absent at staging
//! time; the loser of a race learns the winning event id. `processed:{key}`
//! is set only after a handler ran to completion (or the event was ignored)
//! and is what stops replays from re-running side effects. Both carry the
//! configured TTL so state stays bounded.

use std::sync::Arc;

use crate::kv::Kv;

fn acquire_key(idempotency_key: &str) -> String {
    format!("event_by_idem:{}", idempotency_key)
}

fn processed_key(idempotency_key: &str) -> String {
    format!("processed:{}", idempotency_key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    /// Another event already holds this fingerprint.
    AlreadyHeld { existing_event_id: String },
}

pub struct IdempotencyGuard {
    kv: Arc<dyn Kv>,
    ttl_secs: u64,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn Kv>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    /// Claim a fingerprint for `event_id`. Of any number of concurrent
    /// callers on the same key, at most one sees `Acquired`.
    pub async fn try_acquire(
        &self,
        idempotency_key: &str,
        event_id: &str,
    ) -> anyhow::Result<AcquireResult> {
        let key = acquire_key(idempotency_key);
        if self.kv.set_nx_ex(&key, event_id, self.ttl_secs).await? {
            return Ok(AcquireResult::Acquired);
        }
        let existing = self.kv.get(&key).await?.unwrap_or_default();
        Ok(AcquireResult::AlreadyHeld {
            existing_event_id: existing,
        })
    }

    /// Release a claim so the upstream can retry safely (used when enqueue
    /// fails after acquisition).
    pub async fn release(&self, idempotency_key: &str) -> anyhow::Result<()> {
        self.kv.del(&acquire_key(idempotency_key)).await
    }

    /// The event id currently holding a fingerprint, if any.
    pub async fn holder(&self, idempotency_key: &str) -> anyhow::Result<Option<String>> {
        self.kv.get(&acquire_key(idempotency_key)).await
    }

    pub async fn is_processed(&self, idempotency_key: &str) -> anyhow::Result<bool> {
        self.kv.exists(&processed_key(idempotency_key)).await
    }

    pub async fn mark_processed(&self, idempotency_key: &str) -> anyhow::Result<()> {
        self.kv
            .set_ex(&processed_key(idempotency_key), "1", self.ttl_secs)
            .await
    }
}
