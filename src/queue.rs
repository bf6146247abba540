//! FIFO job queue over the K/V store's queue namespace.
//!
//! Jobs are identified by the event's idempotency key, which gives the queue
//! its one structural guarantee: at most one non-terminal job per fingerprint.
//! A `queue:{name}:job:{id}` marker is claimed on enqueue and cleared only
//! when the job reaches a terminal state; a second enqueue while the marker
//! exists is a no-op.
//!
//! Layout:
//!   queue:{name}:jobs      ready list (FIFO)
//!   queue:{name}:delayed   sorted set of retries, score = due time (unix)
//!   queue:{name}:failed    failure sink, read only by operators
//!   queue:{name}:job:{id}  in-flight marker holding the event id
//!   queue:{name}:stats     started/finished counters for the debug surface

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::kv::Kv;

/// In-flight markers expire with the event records; a job whose event is gone
/// has nothing left to run against.
const JOB_MARKER_TTL_SECS: u64 = 30 * 24 * 3600;

/// How many failure-sink entries the debug surface reports.
const RECENT_FAILURES: isize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: String,
    pub event_id: String,
    pub error: String,
    pub failed_at: String,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub intervals_secs: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            intervals_secs: vec![60, 120, 240],
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have already
    /// run. Clamps to the last interval when attempts outrun the schedule.
    pub fn delay_for_attempt(&self, attempts_so_far: u32) -> u64 {
        if self.intervals_secs.is_empty() {
            return 60;
        }
        let idx = (attempts_so_far.saturating_sub(1) as usize).min(self.intervals_secs.len() - 1);
        self.intervals_secs[idx]
    }

    /// Whether another retry is allowed after `attempts_so_far` attempts.
    pub fn retries_left(&self, attempts_so_far: u32) -> bool {
        attempts_so_far <= self.max_retries
    }
}

pub struct Queue {
    kv: Arc<dyn Kv>,
    name: String,
    pub retry_policy: RetryPolicy,
}

impl Queue {
    pub fn new(kv: Arc<dyn Kv>, name: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            kv,
            name: name.to_string(),
            retry_policy,
        }
    }

    fn ready_key(&self) -> String {
        format!("queue:{}:jobs", self.name)
    }
    fn delayed_key(&self) -> String {
        format!("queue:{}:delayed", self.name)
    }
    fn failed_key(&self) -> String {
        format!("queue:{}:failed", self.name)
    }
    fn job_key(&self, job_id: &str) -> String {
        format!("queue:{}:job:{}", self.name, job_id)
    }
    fn stats_key(&self) -> String {
        format!("queue:{}:stats", self.name)
    }

    /// Enqueue a job. Returns false (no-op) when a job with this id already
    /// exists in a non-terminal state.
    pub async fn enqueue(&self, job_id: &str, event_id: &str) -> anyhow::Result<bool> {
        let claimed = self
            .kv
            .set_nx_ex(&self.job_key(job_id), event_id, JOB_MARKER_TTL_SECS)
            .await?;
        if !claimed {
            debug!(job_id, "Job already in flight, enqueue is a no-op");
            return Ok(false);
        }
        self.kv.rpush(&self.ready_key(), job_id).await?;
        debug!(job_id, event_id, "Job enqueued");
        Ok(true)
    }

    /// Pop the next ready job, promoting due retries first. Returns `None`
    /// when the queue is empty.
    pub async fn dequeue(&self) -> anyhow::Result<Option<Job>> {
        self.promote_due().await?;
        let Some(job_id) = self.kv.lpop(&self.ready_key()).await? else {
            return Ok(None);
        };
        let Some(event_id) = self.kv.get(&self.job_key(&job_id)).await? else {
            // Marker expired out from under the list entry; drop the job.
            debug!(job_id, "Dequeued job without marker, dropping");
            return Ok(None);
        };
        Ok(Some(Job { job_id, event_id }))
    }

    /// Move retries whose due time has passed onto the ready list.
    pub async fn promote_due(&self) -> anyhow::Result<()> {
        let now = Utc::now().timestamp() as f64;
        for job_id in self.kv.zpop_due(&self.delayed_key(), now).await? {
            self.kv.rpush(&self.ready_key(), &job_id).await?;
            debug!(job_id, "Promoted delayed job to ready");
        }
        Ok(())
    }

    /// Reschedule a job after a transient failure. The in-flight marker is
    /// left in place so duplicate webhooks still collapse onto this job.
    pub async fn schedule_retry(&self, job_id: &str, delay_secs: u64) -> anyhow::Result<()> {
        let due = Utc::now().timestamp() as f64 + delay_secs as f64;
        self.kv.zadd(&self.delayed_key(), job_id, due).await?;
        info!(job_id, delay_secs, "Job scheduled for retry");
        Ok(())
    }

    /// Terminal success (or ignored): clear the in-flight marker.
    pub async fn complete(&self, job_id: &str) -> anyhow::Result<()> {
        self.kv.del(&self.job_key(job_id)).await?;
        self.kv.hincr(&self.stats_key(), "finished", 1).await?;
        Ok(())
    }

    /// Terminal failure: record in the failure sink and clear the marker.
    pub async fn fail(&self, job_id: &str, event_id: &str, error: &str) -> anyhow::Result<()> {
        let entry = FailedJob {
            job_id: job_id.to_string(),
            event_id: event_id.to_string(),
            error: error.to_string(),
            failed_at: Utc::now().to_rfc3339(),
        };
        self.kv
            .rpush(&self.failed_key(), &serde_json::to_string(&entry)?)
            .await?;
        self.kv.del(&self.job_key(job_id)).await?;
        self.kv.hincr(&self.stats_key(), "finished", 1).await?;
        info!(job_id, event_id, error, "Job moved to failure sink");
        Ok(())
    }

    pub async fn mark_started(&self) -> anyhow::Result<()> {
        self.kv.hincr(&self.stats_key(), "started", 1).await?;
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<QueueStats> {
        let counters = self.kv.hgetall(&self.stats_key()).await?;
        let get = |f: &str| -> i64 {
            counters
                .get(f)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        let recent_failures = self
            .kv
            .lrange(&self.failed_key(), -RECENT_FAILURES, -1)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();
        Ok(QueueStats {
            queued: self.kv.llen(&self.ready_key()).await?,
            failed: self.kv.llen(&self.failed_key()).await?,
            started: get("started"),
            finished: get("finished"),
            recent_failures,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub failed: u64,
    pub started: i64,
    pub finished: i64,
    pub recent_failures: Vec<FailedJob>,
}
