//! The job runner: turns a queued job into a handler invocation plus status
//! bookkeeping.
//!
//! Owns everything after enqueue: idempotency short-circuit, attempt
//! counting, status transitions, transient-vs-permanent routing, the failure
//! sink, and terminal-failure alerts. The event's `attempts` field is the
//! authoritative counter; the queue never tracks retries itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::events::{EventStatus, EventStore};
use crate::idempotency::IdempotencyGuard;
use crate::jobs::{best_effort_email, dispatch, Clients};
use crate::outcome::{JobError, Outcome};
use crate::queue::{Job, Queue};

/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

pub struct Runner {
    events: Arc<EventStore>,
    guard: Arc<IdempotencyGuard>,
    queue: Arc<Queue>,
    clients: Clients,
}

impl Runner {
    pub fn new(
        events: Arc<EventStore>,
        guard: Arc<IdempotencyGuard>,
        queue: Arc<Queue>,
        clients: Clients,
    ) -> Self {
        Self {
            events,
            guard,
            queue,
            clients,
        }
    }

    /// Execute one job to a terminal or rescheduled state. Infrastructure
    /// errors (K/V store down) bubble up; handler errors never do.
    pub async fn run_job(&self, job: &Job) -> anyhow::Result<()> {
        let Some(event) = self.events.load(&job.event_id).await? else {
            // TTL reclaimed the record; nothing to run against.
            warn!(event_id = %job.event_id, "Event expired before execution, dropping job");
            self.queue.complete(&job.job_id).await?;
            return Ok(());
        };

        // Replays of completed work exit before any side effect.
        if event.status == EventStatus::Processed
            || self.guard.is_processed(&event.idempotency_key).await?
        {
            info!(
                event_id = %event.event_id,
                idempotency_key = %event.idempotency_key,
                "Already processed, skipping"
            );
            // Ignored and failed are terminal too; never rewrite them.
            if !event.status.is_terminal() {
                self.events
                    .set_status(&event.event_id, EventStatus::Processed, None)
                    .await?;
            }
            self.queue.complete(&job.job_id).await?;
            return Ok(());
        }

        let attempts = self.events.increment_attempts(&event.event_id).await?;
        self.events
            .set_status(&event.event_id, EventStatus::Processing, None)
            .await?;
        self.queue.mark_started().await?;
        info!(
            event_id = %event.event_id,
            source = %event.source,
            event_type = %event.event_type,
            attempt = attempts,
            "Processing event"
        );

        match dispatch(&event, &self.clients).await {
            Ok(Outcome::Success) => {
                self.guard.mark_processed(&event.idempotency_key).await?;
                self.events
                    .set_status(&event.event_id, EventStatus::Processed, None)
                    .await?;
                self.queue.complete(&job.job_id).await?;
                info!(event_id = %event.event_id, "Event processed");
            }
            Ok(Outcome::Ignored(reason)) => {
                // Terminal and replay-safe, but not alert-worthy. The reason
                // lands in last_error purely for debugging.
                self.guard.mark_processed(&event.idempotency_key).await?;
                self.events
                    .set_status(&event.event_id, EventStatus::Ignored, Some(&reason))
                    .await?;
                self.queue.complete(&job.job_id).await?;
                info!(event_id = %event.event_id, reason = %reason, "Event ignored");
            }
            Err(JobError::Transient(msg)) => {
                let retries_left = self.queue.retry_policy.retries_left(attempts as u32);
                warn!(
                    event_id = %event.event_id,
                    attempt = attempts,
                    retries_left,
                    error = %msg,
                    "Transient job error"
                );
                if retries_left {
                    self.events
                        .set_status(&event.event_id, EventStatus::Queued, Some(&msg))
                        .await?;
                    let delay = self.queue.retry_policy.delay_for_attempt(attempts as u32);
                    self.queue.schedule_retry(&job.job_id, delay).await?;
                } else {
                    self.finish_failed(&event, job, &msg, "Terminal After Retries")
                        .await?;
                }
            }
            Err(JobError::Permanent(msg)) => {
                error!(event_id = %event.event_id, error = %msg, "Permanent job error");
                self.finish_failed(&event, job, &msg, "Permanent Error").await?;
            }
        }
        Ok(())
    }

    async fn finish_failed(
        &self,
        event: &crate::events::Event,
        job: &Job,
        msg: &str,
        kind: &str,
    ) -> anyhow::Result<()> {
        self.events
            .set_status(&event.event_id, EventStatus::Failed, Some(msg))
            .await?;
        self.queue.fail(&job.job_id, &event.event_id, msg).await?;
        let lead_email = best_effort_email(&event.payload).unwrap_or_default();
        self.clients
            .notifier
            .job_failed(
                kind,
                event.source.as_str(),
                &event.event_type,
                &event.external_id,
                &event.event_id,
                &lead_email,
                msg,
            )
            .await;
        Ok(())
    }
}

/// Pull jobs until shutdown is requested. A pulled job always runs to
/// completion; the flag is only checked between jobs.
pub async fn worker_loop(runner: Arc<Runner>, queue: Arc<Queue>, shutdown: Arc<AtomicBool>) {
    info!("Worker started");
    while !shutdown.load(Ordering::Relaxed) {
        let job = match queue.dequeue().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "Queue dequeue failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };
        if let Err(e) = runner.run_job(&job).await {
            error!(job_id = %job.job_id, error = %e, "Job execution failed on infrastructure error");
        }
    }
    info!("Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;
    use crate::jobs::testing::{harness, harness_with, staged_event, MockCrm, TestHarness};
    use serde_json::json;

    fn runner_for(h: &TestHarness) -> Runner {
        Runner::new(
            h.events.clone(),
            h.guard.clone(),
            h.queue.clone(),
            h.clients.clone(),
        )
    }

    fn booking_payload() -> serde_json::Value {
        json!({
            "event": "booked",
            "payload": {"email": "alice@example.com", "name": "Alice Chen"}
        })
    }

    fn intel_json() -> String {
        json!({"first_name": "Alice", "last_name": "Chen"}).to_string()
    }

    #[tokio::test]
    async fn success_marks_processed_and_sets_marker() {
        let h = harness(vec![Ok(intel_json())]);
        let ev = staged_event(&h, EventSource::Calendar, "booked", "evt-1", booking_payload()).await;
        let runner = runner_for(&h);
        let job = h.queue.dequeue().await.unwrap().unwrap();

        runner.run_job(&job).await.unwrap();

        let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert_eq!(stored.attempts, 1);
        assert!(h.guard.is_processed("calendar:booked:evt-1").await.unwrap());
        assert_eq!(h.crm.write_count(), 2);
    }

    #[tokio::test]
    async fn replay_after_processed_performs_no_writes() {
        let h = harness(vec![Ok(intel_json()), Ok(intel_json())]);
        let ev = staged_event(&h, EventSource::Calendar, "booked", "evt-1", booking_payload()).await;
        let runner = runner_for(&h);
        let job = h.queue.dequeue().await.unwrap().unwrap();
        runner.run_job(&job).await.unwrap();
        let writes_after_first = h.crm.write_count();

        // The marker was cleared by complete(); enqueue the same fingerprint
        // again as a webhook replay would.
        h.queue.enqueue(&job.job_id, &ev.event_id).await.unwrap();
        let replay = h.queue.dequeue().await.unwrap().unwrap();
        runner.run_job(&replay).await.unwrap();

        assert_eq!(h.crm.write_count(), writes_after_first);
        assert_eq!(h.llm_transport.call_count(), 1);
        let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn transient_error_requeues_until_exhaustion_then_alerts_once() {
        // Three CRM 429s after the retries are spent ends in the sink.
        let crm = MockCrm::default();
        *crm.write_errors.lock().unwrap() = vec![
            JobError::transient("crm HTTP 429"),
            JobError::transient("crm HTTP 429"),
            JobError::transient("crm HTTP 429"),
            JobError::transient("crm HTTP 429"),
        ];
        let mut config = crate::config::AppConfig::default();
        config.queue.max_retries = 3;
        let h = harness_with(
            config,
            crm,
            Default::default(),
            vec![
                Ok(intel_json()),
                Ok(intel_json()),
                Ok(intel_json()),
                Ok(intel_json()),
            ],
        );
        let ev = staged_event(&h, EventSource::Calendar, "booked", "evt-1", booking_payload()).await;
        let runner = runner_for(&h);

        // Attempts 1..3: rescheduled each time.
        for expected_attempt in 1..=3i64 {
            let job = h.queue.dequeue().await.unwrap().unwrap();
            assert_eq!(job.event_id, ev.event_id);
            runner.run_job(&job).await.unwrap();
            let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
            assert_eq!(stored.attempts, expected_attempt);
            assert_eq!(stored.status, EventStatus::Queued);
            assert_eq!(stored.last_error.as_deref(), Some("crm HTTP 429"));
            // Pull the retry due immediately for the next round.
            h.queue.schedule_retry(&job.job_id, 0).await.unwrap();
        }

        // Attempt 4 exhausts the policy.
        let job = h.queue.dequeue().await.unwrap().unwrap();
        runner.run_job(&job).await.unwrap();
        let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(h.queue.stats().await.unwrap().failed, 1);
        assert_eq!(h.notify_sink.count(), 1);
        let messages = h.notify_sink.messages.lock().unwrap();
        assert!(messages[0].contains("Terminal After Retries"));
    }

    #[tokio::test]
    async fn transient_then_success_reaches_processed() {
        let crm = MockCrm::default();
        *crm.write_errors.lock().unwrap() = vec![JobError::transient("crm HTTP 429")];
        let h = harness_with(
            Default::default(),
            crm,
            Default::default(),
            vec![Ok(intel_json()), Ok(intel_json())],
        );
        let ev = staged_event(&h, EventSource::Calendar, "booked", "evt-1", booking_payload()).await;
        let runner = runner_for(&h);

        let job = h.queue.dequeue().await.unwrap().unwrap();
        runner.run_job(&job).await.unwrap();
        h.queue.schedule_retry(&job.job_id, 0).await.unwrap();

        let retry = h.queue.dequeue().await.unwrap().unwrap();
        runner.run_job(&retry).await.unwrap();

        let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert_eq!(stored.attempts, 2);
        // Only the success-path booking notification fired; the transient
        // attempt produced no alert.
        assert_eq!(h.notify_sink.count(), 1);
    }

    #[tokio::test]
    async fn permanent_error_fails_immediately_with_one_alert() {
        // Unparseable LLM output twice -> llm_schema_invalid.
        let h = harness(vec![Ok("not json".to_string()), Ok("still not".to_string())]);
        let ev = staged_event(&h, EventSource::Calendar, "booked", "evt-1", booking_payload()).await;
        let runner = runner_for(&h);
        let job = h.queue.dequeue().await.unwrap().unwrap();

        runner.run_job(&job).await.unwrap();

        let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("llm_schema_invalid"));
        assert_eq!(stored.attempts, 1);
        assert_eq!(h.crm.write_count(), 0);
        assert_eq!(h.queue.stats().await.unwrap().failed, 1);
        assert_eq!(h.notify_sink.count(), 1);
        let messages = h.notify_sink.messages.lock().unwrap();
        assert!(messages[0].contains("Permanent Error"));
        assert!(messages[0].contains("alice@example.com"));
    }

    #[tokio::test]
    async fn ignored_outcome_is_terminal_and_replay_safe() {
        let mut config = crate::config::AppConfig::default();
        config.sources.min_duration_minutes = 5;
        let h = harness_with(config, Default::default(), Default::default(), vec![]);
        let payload = json!({
            "session_id": "sess-1",
            "duration_minutes": 3,
            "participants": [{"name": "A", "email": "a@ext.com"}]
        });
        let ev = staged_event(&h, EventSource::MeetingTranscript, "completed", "sess-1", payload)
            .await;
        let runner = runner_for(&h);
        let job = h.queue.dequeue().await.unwrap().unwrap();

        runner.run_job(&job).await.unwrap();

        let stored = h.events.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Ignored);
        assert!(stored.last_error.unwrap().starts_with("too_short"));
        assert!(h
            .guard
            .is_processed("meeting_transcript:completed:sess-1")
            .await
            .unwrap());
        // No alert for ignored events.
        assert_eq!(h.notify_sink.count(), 0);
    }

    #[tokio::test]
    async fn missing_event_exits_silently() {
        let h = harness(vec![]);
        let runner = runner_for(&h);
        let job = crate::queue::Job {
            job_id: "calendar:booked:gone".to_string(),
            event_id: "no-such-event".to_string(),
        };
        runner.run_job(&job).await.unwrap();
        assert_eq!(h.notify_sink.count(), 0);
    }
}
