//! The handler set: one handler per event kind.
//!
//! Handlers are stateless async functions of `(Event, Clients)`; all state
//! lives in the event store and the CRM. The dispatch table below is the
//! single place mapping `(source, event_type)` to a handler.

pub mod calendar;
pub mod enrich;
pub mod meetings;
pub mod support;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::AppConfig;
use crate::crm::CrmApi;
use crate::enrich::EnrichmentApi;
use crate::events::{Event, EventSource};
use crate::llm::LlmClient;
use crate::notify::Notifier;
use crate::outcome::{HandlerResult, JobError};
use crate::staging::Staging;

/// Everything a handler may talk to. Cloned per worker, shared per process.
#[derive(Clone)]
pub struct Clients {
    pub config: Arc<AppConfig>,
    pub crm: Arc<dyn CrmApi>,
    pub llm: Arc<LlmClient>,
    pub enrich: Arc<dyn EnrichmentApi>,
    pub notifier: Notifier,
    pub staging: Arc<Staging>,
}

/// Static dispatch table keyed by `(source, event_type)`.
pub async fn dispatch(event: &Event, clients: &Clients) -> HandlerResult {
    match (event.source, event.event_type.as_str()) {
        (EventSource::Calendar, "booked") => calendar::booked(event, clients).await,
        (EventSource::Calendar, "canceled") => calendar::canceled(event, clients).await,
        (EventSource::Calendar, "rescheduled") => calendar::rescheduled(event, clients).await,
        (EventSource::MeetingTranscript, "completed") => meetings::completed(event, clients).await,
        (EventSource::SupportTag, "tag_added") => support::tag_added(event, clients).await,
        (EventSource::SupportCompany, "company_updated") => {
            support::company_updated(event, clients).await
        }
        (EventSource::ManualEnrich, "enrich_request") => {
            enrich::enrich_request(event, clients).await
        }
        (source, event_type) => Err(JobError::permanent(format!(
            "no handler registered for {}:{}",
            source, event_type
        ))),
    }
}

// ---------------------------------------------------------------------------
// Shared payload helpers
// ---------------------------------------------------------------------------

/// Navigate a nested JSON path, returning `None` on any miss.
pub fn pluck<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in keys {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Non-empty string at a nested path.
pub fn pluck_str(value: &Value, keys: &[&str]) -> Option<String> {
    let s = pluck(value, keys)?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Normalize an ISO-8601 string into the datetime format the CRM accepts
/// (`YYYY-MM-DDTHH:MM:SS+00:00`). Tolerates a trailing `Z`, including the
/// doubled `+00:00Z` some upstreams emit. Returns `None` when unparseable so
/// the caller can drop the field instead of failing the write.
pub fn format_crm_datetime(raw: &str) -> Option<String> {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return None;
    }
    if s.ends_with('Z') && s.matches(['+', '-']).count() > 2 {
        s.pop();
    }
    if s.ends_with('Z') {
        s = format!("{}+00:00", &s[..s.len() - 1]);
    }
    let parsed = DateTime::parse_from_rfc3339(&s).ok()?;
    Some(
        parsed
            .with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%S+00:00")
            .to_string(),
    )
}

/// Best-effort email for alert context. Real matching happens in handlers.
pub fn best_effort_email(payload: &Value) -> Option<String> {
    if let Some(email) = pluck_str(payload, &["payload", "email"])
        .or_else(|| pluck_str(payload, &["payload", "invitee", "email"]))
        .or_else(|| pluck_str(payload, &["email"]))
    {
        return Some(email);
    }
    let attendees = payload
        .get("participants")
        .or_else(|| payload.get("attendees"))?
        .as_array()?;
    attendees
        .iter()
        .find_map(|a| a["email"].as_str().map(str::to_string))
}

#[cfg(test)]
pub mod testing {
    //! Shared mocks for handler and runner tests.

    use super::*;
    use crate::config::AppConfig;
    use crate::crm::Lead;
    use crate::enrich::{CompanyProfile, PersonProfile};
    use crate::events::EventStore;
    use crate::idempotency::IdempotencyGuard;
    use crate::kv::MemoryKv;
    use crate::llm::testing::ScriptedTransport;
    use crate::notify::testing::RecordingSink;
    use crate::queue::{Queue, RetryPolicy};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// CRM double that records every write and serves scripted reads.
    #[derive(Default)]
    pub struct MockCrm {
        pub leads_by_email: Mutex<std::collections::HashMap<String, Lead>>,
        pub leads_by_company: Mutex<std::collections::HashMap<String, Lead>>,
        pub writes: Mutex<Vec<String>>,
        pub find_calls: Mutex<Vec<String>>,
        /// Errors served before writes succeed, front first.
        pub write_errors: Mutex<Vec<JobError>>,
    }

    impl MockCrm {
        pub fn with_lead(self, email: &str, lead: Lead) -> Self {
            self.leads_by_email
                .lock()
                .unwrap()
                .insert(email.to_string(), lead);
            self
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        fn take_error(&self) -> Option<JobError> {
            let mut errors = self.write_errors.lock().unwrap();
            if errors.is_empty() {
                None
            } else {
                Some(errors.remove(0))
            }
        }
    }

    #[async_trait]
    impl CrmApi for MockCrm {
        async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, JobError> {
            self.find_calls.lock().unwrap().push(email.to_string());
            Ok(self.leads_by_email.lock().unwrap().get(email).cloned())
        }

        async fn find_lead_by_company(&self, company: &str) -> Result<Option<Lead>, JobError> {
            Ok(self.leads_by_company.lock().unwrap().get(company).cloned())
        }

        async fn upsert_lead_by_email(
            &self,
            email: &str,
            fields: Value,
        ) -> Result<String, JobError> {
            if let Some(err) = self.take_error() {
                return Err(err);
            }
            self.writes
                .lock()
                .unwrap()
                .push(format!("upsert_email:{}:{}", email, fields));
            Ok("lead-1".to_string())
        }

        async fn upsert_lead_by_company(
            &self,
            company: &str,
            fields: Value,
        ) -> Result<String, JobError> {
            if let Some(err) = self.take_error() {
                return Err(err);
            }
            self.writes
                .lock()
                .unwrap()
                .push(format!("upsert_company:{}:{}", company, fields));
            Ok("lead-2".to_string())
        }

        async fn create_note(
            &self,
            lead_id: &str,
            title: &str,
            _body: &str,
        ) -> Result<(), JobError> {
            if let Some(err) = self.take_error() {
                return Err(err);
            }
            self.writes
                .lock()
                .unwrap()
                .push(format!("note:{}:{}", lead_id, title));
            Ok(())
        }

        async fn create_task(
            &self,
            lead_id: &str,
            subject: &str,
            _due: NaiveDate,
            priority: &str,
            _body: &str,
        ) -> Result<(), JobError> {
            if let Some(err) = self.take_error() {
                return Err(err);
            }
            self.writes
                .lock()
                .unwrap()
                .push(format!("task:{}:{}:{}", lead_id, subject, priority));
            Ok(())
        }

        async fn upload_lead_photo(
            &self,
            lead_id: &str,
            _image: &[u8],
            filename: &str,
        ) -> Result<bool, JobError> {
            self.writes
                .lock()
                .unwrap()
                .push(format!("photo:{}:{}", lead_id, filename));
            Ok(true)
        }
    }

    /// Enrichment double with fixed responses per sub-step.
    #[derive(Default)]
    pub struct MockEnrichment {
        pub person: Option<PersonProfile>,
        pub company: Option<CompanyProfile>,
        pub homepage_text: Option<String>,
        pub logo: Option<Vec<u8>>,
        pub fail_all: bool,
    }

    #[async_trait]
    impl EnrichmentApi for MockEnrichment {
        async fn enrich_person(&self, _email: &str) -> Result<Option<PersonProfile>, JobError> {
            if self.fail_all {
                return Err(JobError::transient("contact enrichment HTTP 503"));
            }
            Ok(self.person.clone())
        }

        async fn enrich_company(&self, _domain: &str) -> Result<Option<CompanyProfile>, JobError> {
            if self.fail_all {
                return Err(JobError::transient("contact enrichment HTTP 503"));
            }
            Ok(self.company.clone())
        }

        async fn scrape_homepage_text(&self, _domain: &str) -> Result<String, JobError> {
            if self.fail_all {
                return Err(JobError::transient("scraper HTTP 503"));
            }
            Ok(self.homepage_text.clone().unwrap_or_default())
        }

        async fn fetch_logo(&self, _domain: &str) -> Result<Option<Vec<u8>>, JobError> {
            if self.fail_all {
                return Err(JobError::transient("logo fetch HTTP 503"));
            }
            Ok(self.logo.clone())
        }
    }

    pub struct TestHarness {
        pub clients: Clients,
        pub crm: Arc<MockCrm>,
        pub enrichment: Arc<MockEnrichment>,
        pub llm_transport: Arc<ScriptedTransport>,
        pub notify_sink: Arc<RecordingSink>,
        pub events: Arc<EventStore>,
        pub guard: Arc<IdempotencyGuard>,
        pub queue: Arc<Queue>,
        pub kv: Arc<MemoryKv>,
    }

    /// Wire a full [`Clients`] bundle onto mocks and an in-memory K/V store.
    pub fn harness_with(
        config: AppConfig,
        crm: MockCrm,
        enrichment: MockEnrichment,
        llm_responses: Vec<Result<String, JobError>>,
    ) -> TestHarness {
        let kv = Arc::new(MemoryKv::new());
        let config = Arc::new(config);
        let events = Arc::new(EventStore::new(kv.clone(), config.service.event_ttl_secs));
        let guard = Arc::new(IdempotencyGuard::new(
            kv.clone(),
            config.service.idempotency_ttl_secs,
        ));
        let queue = Arc::new(Queue::new(
            kv.clone(),
            &config.redis.queue_name,
            RetryPolicy {
                max_retries: config.queue.max_retries,
                intervals_secs: config.queue.retry_intervals_secs.clone(),
            },
        ));
        let staging = Arc::new(Staging::new(events.clone(), guard.clone(), queue.clone()));

        let crm = Arc::new(crm);
        let enrichment = Arc::new(enrichment);
        let llm_transport = Arc::new(ScriptedTransport::new(llm_responses));
        let notify_sink = Arc::new(RecordingSink::default());

        let clients = Clients {
            config: config.clone(),
            crm: crm.clone(),
            llm: Arc::new(LlmClient::new(
                llm_transport.clone(),
                config.llm.prompt_char_budget,
            )),
            enrich: enrichment.clone(),
            notifier: Notifier::new(notify_sink.clone()),
            staging,
        };

        TestHarness {
            clients,
            crm,
            enrichment,
            llm_transport,
            notify_sink,
            events,
            guard,
            queue,
            kv,
        }
    }

    pub fn harness(llm_responses: Vec<Result<String, JobError>>) -> TestHarness {
        harness_with(
            AppConfig::default(),
            MockCrm::default(),
            MockEnrichment::default(),
            llm_responses,
        )
    }

    /// Stage an event and return the stored record, ready for dispatch.
    pub async fn staged_event(
        h: &TestHarness,
        source: EventSource,
        event_type: &str,
        external_id: &str,
        payload: Value,
    ) -> Event {
        let resp = h
            .clients
            .staging
            .stage(source, event_type, external_id, &payload)
            .await
            .unwrap();
        let crate::staging::StagingResponse::Queued { event_id, .. } = resp else {
            panic!("expected queued response");
        };
        h.events.load(&event_id).await.unwrap().unwrap()
    }
}
