//! Best-effort chat notifications.
//!
//! The notifier posts markdown text to a configured chat webhook. It never
//! propagates failure: a dead webhook must not take a job down with it, so
//! every error is swallowed and logged. No retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Transport seam so tests can observe what would have been posted.
#[async_trait]
pub trait NotifySink: Send + Sync {
    /// Deliver one message. Implementations must not return errors.
    async fn send(&self, text: &str);
}

pub struct WebhookSink {
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NotifySink for WebhookSink {
    async fn send(&self, text: &str) {
        if self.webhook_url.is_empty() {
            debug!("Notifier webhook not configured; dropping message");
            return;
        }
        let payload = serde_json::json!({ "text": text });
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "Notifier webhook rejected message");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to deliver notifier message"),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotifySink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotifySink>) -> Self {
        Self { sink }
    }

    pub fn webhook(webhook_url: &str) -> Self {
        Self::new(Arc::new(WebhookSink::new(webhook_url)))
    }

    /// Post a titled message. Best-effort; never raises.
    pub async fn notify(&self, title: &str, body: &str, severity: Severity) {
        let text = format!("*[{}] {}*\n\n{}", severity.label(), title, body);
        self.sink.send(&text).await;
    }

    /// Structured field list under a title, the shape most alerts use.
    pub async fn notify_fields(
        &self,
        title: &str,
        message: &str,
        fields: &[(&str, String)],
        severity: Severity,
    ) {
        let mut lines = vec![message.to_string()];
        if !fields.is_empty() {
            lines.push(String::new());
            for (name, value) in fields {
                let value = if value.is_empty() { "unknown" } else { value };
                lines.push(format!("*{}*: {}", name, value));
            }
        }
        self.notify(title, &lines.join("\n"), severity).await;
    }

    /// Terminal job failure alert fired by the runner.
    pub async fn job_failed(
        &self,
        kind: &str,
        source: &str,
        event_type: &str,
        external_id: &str,
        event_id: &str,
        lead_email: &str,
        error: &str,
    ) {
        self.notify_fields(
            &format!("Job Failed ({})", kind),
            "A background job reached a terminal failure.",
            &[
                ("Source", source.to_string()),
                ("Event Type", event_type.to_string()),
                ("External ID", external_id.to_string()),
                ("Event ID", event_id.to_string()),
                ("Lead Email", lead_email.to_string()),
                ("Error", error.to_string()),
            ],
            Severity::Critical,
        )
        .await;
    }
}
