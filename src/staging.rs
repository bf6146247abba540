//! The staging pipeline shared by every ingress path:
//! store -> acquire -> enqueue -> respond.
//!
//! Ordering matters. The event is written first so the idempotency index
//! never points at a missing record; a caller losing the acquire race deletes
//! its own freshly staged event and reports the winner's id. If the enqueue
//! fails the acquire is rolled back, leaving the upstream free to retry with
//! no side effects outside the K/V store.

use std::sync::Arc;

use tracing::{error, info};

use crate::events::{idempotency_key, EventSource, EventStatus, EventStore};
use crate::idempotency::{AcquireResult, IdempotencyGuard};
use crate::queue::Queue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingResponse {
    Queued {
        event_id: String,
        idempotency_key: String,
    },
    /// Another event already holds this fingerprint.
    Duplicate { event_id: String },
}

pub struct Staging {
    events: Arc<EventStore>,
    guard: Arc<IdempotencyGuard>,
    queue: Arc<Queue>,
}

impl Staging {
    pub fn new(events: Arc<EventStore>, guard: Arc<IdempotencyGuard>, queue: Arc<Queue>) -> Self {
        Self {
            events,
            guard,
            queue,
        }
    }

    pub async fn stage(
        &self,
        source: EventSource,
        event_type: &str,
        external_id: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<StagingResponse> {
        let idem_key = idempotency_key(source, event_type, external_id);

        let event = self
            .events
            .store(source, event_type, external_id, &idem_key, payload)
            .await?;

        match self.guard.try_acquire(&idem_key, &event.event_id).await? {
            AcquireResult::AlreadyHeld { existing_event_id } => {
                self.events.delete(&event.event_id).await?;
                info!(
                    idempotency_key = %idem_key,
                    existing_event_id = %existing_event_id,
                    "Duplicate event, responding with original event id"
                );
                return Ok(StagingResponse::Duplicate {
                    event_id: existing_event_id,
                });
            }
            AcquireResult::Acquired => {}
        }

        if let Err(e) = self.queue.enqueue(&idem_key, &event.event_id).await {
            // Roll back the acquire so the upstream retry is not treated as a
            // duplicate of an event that never made it onto the queue.
            error!(event_id = %event.event_id, error = %e, "Enqueue failed during staging");
            self.guard.release(&idem_key).await?;
            self.events
                .set_status(
                    &event.event_id,
                    EventStatus::Failed,
                    Some(&format!("enqueue_failed: {}", e)),
                )
                .await?;
            return Err(e);
        }

        info!(
            event_id = %event.event_id,
            idempotency_key = %idem_key,
            source = %source,
            event_type,
            "Event staged and queued"
        );
        Ok(StagingResponse::Queued {
            event_id: event.event_id,
            idempotency_key: idem_key,
        })
    }
}
