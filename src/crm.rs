//! Outbound CRM client.
//!
//! Wraps the CRM's v2 record API: find/upsert leads, attach notes and tasks,
//! upload a lead photo. Access tokens come from a lazy refresh-token flow;
//! the current token is cached both in process memory and in the K/V store
//! (key `crm:access_token`) so concurrent workers do not hammer the token
//! endpoint.
//!
//! Under dry-run every write is logged and skipped, returning a synthetic ok.
//! Reads are skipped too so end-to-end flows work without credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CrmConfig;
use crate::kv::Kv;
use crate::outcome::{classify_reqwest, classify_status, JobError};

const TOKEN_CACHE_KEY: &str = "crm:access_token";
/// Refresh slightly before the provider-reported expiry.
const TOKEN_EXPIRY_SLACK_SECS: u64 = 30;
/// CRM caps lead photos at 10 MB.
const MAX_PHOTO_BYTES: usize = 10 * 1024 * 1024;

pub const DRY_RUN_LEAD_ID: &str = "dry_run_lead_id";

/// A lead record as returned by the CRM, id plus raw fields.
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: String,
    pub fields: Value,
}

impl Lead {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, JobError>;
    async fn find_lead_by_company(&self, company: &str) -> Result<Option<Lead>, JobError>;
    /// Update the lead matching `email`, or create one. Returns the lead id.
    async fn upsert_lead_by_email(&self, email: &str, fields: Value) -> Result<String, JobError>;
    /// Company-keyed upsert; preserves an existing primary email on update.
    async fn upsert_lead_by_company(
        &self,
        company: &str,
        fields: Value,
    ) -> Result<String, JobError>;
    async fn create_note(&self, lead_id: &str, title: &str, body: &str) -> Result<(), JobError>;
    async fn create_task(
        &self,
        lead_id: &str,
        subject: &str,
        due: NaiveDate,
        priority: &str,
        body: &str,
    ) -> Result<(), JobError>;
    /// Best-effort photo upload. Returns whether the upload happened.
    async fn upload_lead_photo(
        &self,
        lead_id: &str,
        image: &[u8],
        filename: &str,
    ) -> Result<bool, JobError>;
}

struct CachedToken {
    access_token: String,
    expires_at_epoch: i64,
}

pub struct CrmClient {
    config: CrmConfig,
    dry_run: bool,
    kv: Arc<dyn Kv>,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl CrmClient {
    pub fn new(
        config: CrmConfig,
        dry_run: bool,
        kv: Arc<dyn Kv>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            config,
            dry_run,
            kv,
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            token: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Token management
    // -----------------------------------------------------------------------

    async fn access_token(&self) -> Result<String, JobError> {
        self.access_token_with_origin().await.map(|(token, _)| token)
    }

    /// The current token plus whether it came from the shared K/V cache
    /// (i.e. another process refreshed it) rather than our own refresh.
    async fn access_token_with_origin(&self) -> Result<(String, bool), JobError> {
        if self.dry_run {
            return Ok(("dry_run_access_token".to_string(), false));
        }

        // K/V first: shared across workers and restarts.
        if let Ok(Some(token)) = self.kv.get(TOKEN_CACHE_KEY).await {
            return Ok((token, true));
        }

        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at_epoch > Utc::now().timestamp() {
                return Ok((cached.access_token.clone(), false));
            }
        }

        let refreshed = self.refresh_access_token().await?;
        let ttl = (refreshed.expires_at_epoch - Utc::now().timestamp()).max(60) as u64;
        if let Err(e) = self
            .kv
            .set_ex(TOKEN_CACHE_KEY, &refreshed.access_token, ttl)
            .await
        {
            warn!(error = %e, "Could not cache CRM token in K/V store");
        }
        let token = refreshed.access_token.clone();
        *guard = Some(refreshed);
        Ok((token, false))
    }

    async fn refresh_access_token(&self) -> Result<CachedToken, JobError> {
        if self.config.refresh_token.is_empty()
            || self.config.client_id.is_empty()
            || self.config.client_secret.is_empty()
        {
            return Err(JobError::permanent(
                "CRM OAuth credentials missing (client id/secret/refresh token)",
            ));
        }

        let params = [
            ("refresh_token", self.config.refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .http
            .post(self.config.datacenter.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "crm token refresh"))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or_else(|_| json!({}));

        if !(200..300).contains(&status) {
            if is_token_rate_limit(&body) {
                return Err(JobError::transient(format!(
                    "crm token refresh rate-limited: HTTP {}",
                    status
                )));
            }
            return Err(classify_status(status, "crm token refresh"));
        }

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| JobError::permanent("crm token refresh response missing access_token"))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(50 * 60);
        info!("CRM access token refreshed");
        Ok(CachedToken {
            access_token,
            expires_at_epoch: Utc::now().timestamp() + expires_in
                - TOKEN_EXPIRY_SLACK_SECS as i64,
        })
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
        let _ = self.kv.del(TOKEN_CACHE_KEY).await;
    }

    // -----------------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, JobError> {
        let mut retried_auth = false;
        loop {
            let (token, from_shared_cache) = self.access_token_with_origin().await?;
            let url = format!("{}{}", self.config.datacenter.api_base(), path);
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("Zoho-oauthtoken {}", token));
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| classify_reqwest(&e, "crm"))?;
            let status = resp.status().as_u16();

            if status == 401 {
                if !retried_auth {
                    // One stale-token retry.
                    debug!("CRM returned 401, invalidating cached token and retrying");
                    self.invalidate_token().await;
                    retried_auth = true;
                    continue;
                }
                if from_shared_cache {
                    // The retry picked up a token another process wrote while
                    // we were invalidating; let the queue retry once the
                    // refresh race settles.
                    return Err(JobError::transient("crm 401 during token-refresh race"));
                }
                // Our own fresh token was rejected: a real auth problem.
            }
            if !(200..300).contains(&status) {
                return Err(classify_status(status, "crm"));
            }
            // Search endpoints return 204 with no body when nothing matches.
            if status == 204 {
                return Ok(json!({}));
            }
            return Ok(resp.json().await.unwrap_or_else(|_| json!({})));
        }
    }

    async fn search_one(&self, criteria: &str) -> Result<Option<Lead>, JobError> {
        let path = format!(
            "/{}/search?criteria={}",
            self.config.leads_module,
            urlencode(criteria)
        );
        let body = self.request(reqwest::Method::GET, &path, None).await?;
        let Some(first) = body["data"].as_array().and_then(|d| d.first()) else {
            return Ok(None);
        };
        let id = first["id"].as_str().unwrap_or_default().to_string();
        if id.is_empty() {
            return Ok(None);
        }
        Ok(Some(Lead {
            id,
            fields: first.clone(),
        }))
    }

    fn create_lead<'a>(
        &'a self,
        fields: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, JobError>> + Send + 'a>>
    {
        Box::pin(async move {
            if self.dry_run {
                info!(fields = %fields, "DRY_RUN crm create_lead skipped");
                return Ok(DRY_RUN_LEAD_ID.to_string());
            }
            let path = format!("/{}", self.config.leads_module);
            let body = self
                .request(
                    reqwest::Method::POST,
                    &path,
                    Some(&json!({ "data": [fields.clone()] })),
                )
                .await?;
            let data = &body["data"][0];
            if let Some(id) = data["details"]["id"].as_str() {
                info!(lead_id = id, "CRM lead created");
                return Ok(id.to_string());
            }
            // The record API rejects the whole insert when one datetime field is
            // malformed; drop that field and retry once rather than losing the
            // lead.
            if data["code"].as_str() == Some("INVALID_DATA")
                && data["details"]["expected_data_type"].as_str() == Some("datetime")
            {
                if let Some(bad_field) = data["details"]["api_name"].as_str() {
                    warn!(field = bad_field, "CRM rejected datetime field, retrying without it");
                    let mut retry_fields = fields;
                    if let Some(map) = retry_fields.as_object_mut() {
                        map.remove(bad_field);
                    }
                    return self.create_lead(retry_fields).await;
                }
            }
            Err(JobError::permanent(format!(
                "crm create lead response missing id: {}",
                crate::util::truncate_for_log(&body.to_string(), 300)
            )))
        })
    }

    async fn update_lead(&self, lead_id: &str, fields: &Value) -> Result<(), JobError> {
        if self.dry_run {
            info!(lead_id, fields = %fields, "DRY_RUN crm update_lead skipped");
            return Ok(());
        }
        let path = format!("/{}/{}", self.config.leads_module, lead_id);
        let body = self
            .request(
                reqwest::Method::PUT,
                &path,
                Some(&json!({ "data": [fields] })),
            )
            .await?;
        let status = body["data"][0]["status"].as_str().unwrap_or("unknown");
        if status != "success" {
            warn!(lead_id, status, "CRM update reported non-success status");
        }
        Ok(())
    }
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, JobError> {
        if self.dry_run {
            info!(email, "DRY_RUN crm find_lead_by_email skipped");
            return Ok(None);
        }
        self.search_one(&format!("(Email:equals:{})", email)).await
    }

    async fn find_lead_by_company(&self, company: &str) -> Result<Option<Lead>, JobError> {
        if self.dry_run {
            info!(company, "DRY_RUN crm find_lead_by_company skipped");
            return Ok(None);
        }
        self.search_one(&format!("(Company:equals:\"{}\")", company))
            .await
    }

    async fn upsert_lead_by_email(&self, email: &str, fields: Value) -> Result<String, JobError> {
        if let Some(existing) = self.find_lead_by_email(email).await? {
            self.update_lead(&existing.id, &fields).await?;
            return Ok(existing.id);
        }
        self.create_lead(fields).await
    }

    async fn upsert_lead_by_company(
        &self,
        company: &str,
        mut fields: Value,
    ) -> Result<String, JobError> {
        if let Some(existing) = self.find_lead_by_company(company).await? {
            // Keep the first contact as the primary email when later signals
            // arrive from other people at the same company.
            let has_email = existing
                .field_str("Email")
                .is_some_and(|e| !e.is_empty());
            if has_email {
                if let Some(map) = fields.as_object_mut() {
                    map.remove("Email");
                }
            }
            self.update_lead(&existing.id, &fields).await?;
            return Ok(existing.id);
        }
        self.create_lead(fields).await
    }

    async fn create_note(&self, lead_id: &str, title: &str, body: &str) -> Result<(), JobError> {
        if self.dry_run {
            info!(lead_id, title, body_len = body.len(), "DRY_RUN crm create_note skipped");
            return Ok(());
        }
        let payload = json!({
            "data": [{
                "Note_Title": title,
                "Note_Content": body,
                "Parent_Id": lead_id,
                "se_module": self.config.leads_module,
            }]
        });
        self.request(reqwest::Method::POST, "/Notes", Some(&payload))
            .await?;
        Ok(())
    }

    async fn create_task(
        &self,
        lead_id: &str,
        subject: &str,
        due: NaiveDate,
        priority: &str,
        body: &str,
    ) -> Result<(), JobError> {
        if self.dry_run {
            info!(lead_id, subject, due = %due, priority, "DRY_RUN crm create_task skipped");
            return Ok(());
        }
        let payload = json!({
            "data": [{
                "Subject": subject,
                "Due_Date": due.to_string(),
                "Priority": priority,
                "What_Id": lead_id,
                "se_module": self.config.leads_module,
                "Description": body,
                "Status": "Not Started",
            }]
        });
        self.request(reqwest::Method::POST, "/Tasks", Some(&payload))
            .await?;
        Ok(())
    }

    async fn upload_lead_photo(
        &self,
        lead_id: &str,
        image: &[u8],
        filename: &str,
    ) -> Result<bool, JobError> {
        if self.dry_run {
            info!(lead_id, size = image.len(), "DRY_RUN crm upload_lead_photo skipped");
            return Ok(true);
        }
        if image.len() > MAX_PHOTO_BYTES {
            warn!(lead_id, size = image.len(), "Lead photo exceeds size cap, skipping");
            return Ok(false);
        }
        let token = self.access_token().await?;
        let url = format!(
            "{}/{}/{}/photo",
            self.config.datacenter.api_base(),
            self.config.leads_module,
            lead_id
        );
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(filename.to_string())
            .mime_str("image/png")
            .map_err(|e| JobError::permanent(format!("photo mime: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Zoho-oauthtoken {}", token))
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "crm photo upload"))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            warn!(lead_id, status, "Lead photo upload rejected");
            return Ok(false);
        }
        Ok(true)
    }
}

/// The token endpoint reports rate limiting inconsistently: a plain "too
/// many requests", a "rate ... limit" phrasing, or a 400 "Access Denied" in
/// some regions. All of them are transient like a 429.
fn is_token_rate_limit(body: &Value) -> bool {
    let desc = body["error_description"]
        .as_str()
        .unwrap_or("")
        .to_ascii_lowercase();
    let err = body["error"].as_str().unwrap_or("").to_ascii_lowercase();
    desc.contains("too many requests")
        || (desc.contains("rate") && desc.contains("limit"))
        || err.contains("access denied")
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'(' | b')'
            | b':' | b',' | b'=' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
