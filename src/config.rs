//! Application configuration.
//!
//! One immutable [`AppConfig`] value is loaded from `config.toml` at startup
//! and threaded explicitly into the HTTP server and the worker. Startup
//! validates the fields that matter at runtime and exits with code 1 on
//! violations, so a misconfigured deploy fails fast instead of failing a job.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// When true, outbound CRM writes are logged and skipped. LLM calls still
    /// execute.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub allow_debug_endpoints: bool,
    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Parallel workers per worker process.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            dry_run: true,
            allow_debug_endpoints: false,
            event_ttl_secs: default_event_ttl_secs(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_true() -> bool {
    true
}
fn default_event_ttl_secs() -> u64 {
    30 * 24 * 3600
}
fn default_idempotency_ttl_secs() -> u64 {
    90 * 24 * 3600
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_worker_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            queue_name: default_queue_name(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_queue_name() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals_secs: Vec<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_intervals_secs: default_retry_intervals(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_intervals() -> Vec<u64> {
    vec![60, 120, 240]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    /// HMAC signing key for the calendar source (`t=,v1=` header scheme).
    #[serde(default)]
    pub calendar_signing_key: String,
    /// Shared secret for the meeting-transcript source.
    #[serde(default)]
    pub meeting_shared_secret: String,
    /// Optional HMAC secret for the support source.
    #[serde(default)]
    pub support_webhook_secret: String,
    /// API key gating the manual enrichment endpoint.
    #[serde(default)]
    pub enrich_api_key: String,
    /// Domains treated as internal when ranking meeting attendees.
    #[serde(default)]
    pub customer_domains: Vec<String>,
    /// Meetings shorter than this are ignored at ingress.
    #[serde(default = "default_min_duration_minutes")]
    pub min_duration_minutes: i64,
    /// Support-tool tag names that qualify a contact as a lead.
    #[serde(default)]
    pub qualifying_tags: Vec<String>,
}

fn default_min_duration_minutes() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrmDatacenter {
    #[default]
    Us,
    Eu,
    In,
    Au,
}

impl CrmDatacenter {
    /// Base URL of the CRM record API for this datacenter.
    pub fn api_base(&self) -> &'static str {
        match self {
            CrmDatacenter::Us => "https://www.zohoapis.com/crm/v2",
            CrmDatacenter::Eu => "https://www.zohoapis.eu/crm/v2",
            CrmDatacenter::In => "https://www.zohoapis.in/crm/v2",
            CrmDatacenter::Au => "https://www.zohoapis.com.au/crm/v2",
        }
    }

    /// OAuth token endpoint for this datacenter.
    pub fn token_url(&self) -> &'static str {
        match self {
            CrmDatacenter::Us => "https://accounts.zoho.com/oauth/v2/token",
            CrmDatacenter::Eu => "https://accounts.zoho.eu/oauth/v2/token",
            CrmDatacenter::In => "https://accounts.zoho.in/oauth/v2/token",
            CrmDatacenter::Au => "https://accounts.zoho.com.au/oauth/v2/token",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrmConfig {
    #[serde(default)]
    pub datacenter: CrmDatacenter,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default = "default_leads_module")]
    pub leads_module: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default = "default_status_booked")]
    pub status_booked: String,
    #[serde(default = "default_status_completed")]
    pub status_completed: String,
    #[serde(default = "default_status_canceled")]
    pub status_canceled: String,
    #[serde(default = "default_status_qualified")]
    pub status_qualified: String,
    /// Keep a demo datetime written by an earlier booking when a transcript
    /// arrives for the same lead.
    #[serde(default = "default_true")]
    pub preserve_existing_demo_date: bool,
    #[serde(default)]
    pub create_followup_task: bool,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            datacenter: CrmDatacenter::default(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
            leads_module: default_leads_module(),
            owner_id: String::new(),
            status_booked: default_status_booked(),
            status_completed: default_status_completed(),
            status_canceled: default_status_canceled(),
            status_qualified: default_status_qualified(),
            preserve_existing_demo_date: true,
            create_followup_task: false,
        }
    }
}

fn default_leads_module() -> String {
    "Leads".to_string()
}
fn default_status_booked() -> String {
    "Demo Booked".to_string()
}
fn default_status_completed() -> String {
    "Demo Complete".to_string()
}
fn default_status_canceled() -> String {
    "Demo Canceled".to_string()
}
fn default_status_qualified() -> String {
    "Support Qualified".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Character budget for large text inputs (transcripts). Inputs over the
    /// budget are truncated head+tail deterministically.
    #[serde(default = "default_prompt_char_budget")]
    pub prompt_char_budget: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_llm_model(),
            prompt_char_budget: default_prompt_char_budget(),
        }
    }
}

fn default_llm_model() -> String {
    "gemini-1.5-pro".to_string()
}
fn default_prompt_char_budget() -> usize {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    /// Contact/company enrichment API key. Empty disables those sub-steps.
    #[serde(default)]
    pub contact_api_key: String,
    #[serde(default = "default_contact_cache_ttl_days")]
    pub contact_cache_ttl_days: u64,
    /// Logo lookup API key. Empty disables the logo sub-step.
    #[serde(default)]
    pub logo_api_key: String,
    #[serde(default = "default_scrape_timeout_secs")]
    pub scrape_timeout_secs: u64,
    /// After a booking is processed, enqueue a follow-up enrich job.
    #[serde(default)]
    pub auto_enrich_after_booking: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            contact_api_key: String::new(),
            contact_cache_ttl_days: default_contact_cache_ttl_days(),
            logo_api_key: String::new(),
            scrape_timeout_secs: default_scrape_timeout_secs(),
            auto_enrich_after_booking: false,
        }
    }
}

fn default_contact_cache_ttl_days() -> u64 {
    30
}
fn default_scrape_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifyConfig {
    /// Chat webhook URL. Empty disables notifications (logged instead).
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SignalsConfig {
    /// Per-plan member/project limits. Not derivable from payloads.
    #[serde(default)]
    pub plans: Vec<PlanLimits>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlanLimits {
    pub name: String,
    #[serde(default)]
    pub member_limit: Option<i64>,
    #[serde(default)]
    pub project_limit: Option<i64>,
}

impl SignalsConfig {
    pub fn limits_for(&self, plan_name: &str) -> Option<&PlanLimits> {
        self.plans.iter().find(|p| p.name == plan_name)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Validate runtime-critical fields. Returns every violation found so a
    /// broken deploy surfaces the whole list at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.service.dry_run {
            if self.crm.client_id.is_empty() {
                errors.push("crm.client_id is required when dry_run = false".to_string());
            }
            if self.crm.client_secret.is_empty() {
                errors.push("crm.client_secret is required when dry_run = false".to_string());
            }
            if self.crm.refresh_token.is_empty() {
                errors.push("crm.refresh_token is required when dry_run = false".to_string());
            }
        }
        if self.redis.url.is_empty() {
            errors.push("redis.url must not be empty".to_string());
        }
        if self.queue.retry_intervals_secs.is_empty() {
            errors.push("queue.retry_intervals_secs must not be empty".to_string());
        }
        if self.service.event_ttl_secs == 0 {
            errors.push("service.event_ttl_secs must be positive".to_string());
        }
        if self.service.idempotency_ttl_secs == 0 {
            errors.push("service.idempotency_ttl_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Log one startup warning per source accepting unsigned requests.
    pub fn warn_on_missing_secrets(&self) {
        let sources = [
            ("calendar", self.sources.calendar_signing_key.is_empty()),
            ("meetings", self.sources.meeting_shared_secret.is_empty()),
            ("support", self.sources.support_webhook_secret.is_empty()),
            ("enrich", self.sources.enrich_api_key.is_empty()),
        ];
        for (source, missing) in sources {
            if missing {
                tracing::warn!(
                    source,
                    "No secret configured; accepting unsigned requests for this source"
                );
            }
        }
    }
}
