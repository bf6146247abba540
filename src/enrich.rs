//! Third-party enrichment clients: contact/company lookup, homepage
//! scraping, and logo fetch.
//!
//! All four operations sit behind one trait so the enrich handler can fan
//! out over them uniformly and tests can substitute the lot. Contact and
//! company lookups are cached in the K/V store; enrichment data goes stale
//! slowly and the upstream API meters aggressively.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EnrichConfig;
use crate::kv::Kv;
use crate::outcome::{classify_reqwest, classify_status, JobError};
use crate::util::clean_domain;

const CONTACT_API_BASE: &str = "https://api.apollo.io/v1";
const LOGO_API_BASE: &str = "https://api.brandfetch.io/v2/brands";

/// How much homepage text the scraper keeps for LLM analysis.
const SCRAPE_TEXT_CAP: usize = 20_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonProfile {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub seniority: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub linkedin_url: String,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub employee_count: String,
    #[serde(default)]
    pub revenue: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub founded_year: String,
    #[serde(default)]
    pub funding_stage: String,
    #[serde(default)]
    pub technologies: Vec<String>,
}

#[async_trait]
pub trait EnrichmentApi: Send + Sync {
    async fn enrich_person(&self, email: &str) -> Result<Option<PersonProfile>, JobError>;
    async fn enrich_company(&self, domain: &str) -> Result<Option<CompanyProfile>, JobError>;
    /// Readable text of the company homepage, capped for LLM consumption.
    async fn scrape_homepage_text(&self, domain: &str) -> Result<String, JobError>;
    async fn fetch_logo(&self, domain: &str) -> Result<Option<Vec<u8>>, JobError>;
}

pub struct EnrichmentClient {
    config: EnrichConfig,
    kv: Arc<dyn Kv>,
    http: reqwest::Client,
}

impl EnrichmentClient {
    pub fn new(config: EnrichConfig, kv: Arc<dyn Kv>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.scrape_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, kv, http }
    }

    fn cache_ttl_secs(&self) -> u64 {
        self.config.contact_cache_ttl_days * 24 * 3600
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.kv.get(key).await.ok()??;
        match serde_json::from_str(&raw) {
            Ok(v) => {
                debug!(key, "Enrichment cache hit");
                Some(v)
            }
            Err(e) => {
                warn!(key, error = %e, "Dropping unparseable enrichment cache entry");
                None
            }
        }
    }

    async fn store_cache<T: Serialize>(&self, key: &str, value: &T) {
        if let Ok(raw) = serde_json::to_string(value) {
            if let Err(e) = self.kv.set_ex(key, &raw, self.cache_ttl_secs()).await {
                warn!(key, error = %e, "Could not cache enrichment result");
            }
        }
    }

    async fn contact_api_post(&self, path: &str, body: Value) -> Result<Value, JobError> {
        let resp = self
            .http
            .post(format!("{}{}", CONTACT_API_BASE, path))
            .header("X-Api-Key", &self.config.contact_api_key)
            .header("Cache-Control", "no-cache")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "contact enrichment"))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status(status, "contact enrichment"));
        }
        resp.json()
            .await
            .map_err(|e| JobError::transient(format!("contact enrichment body: {}", e)))
    }
}

#[async_trait]
impl EnrichmentApi for EnrichmentClient {
    async fn enrich_person(&self, email: &str) -> Result<Option<PersonProfile>, JobError> {
        if self.config.contact_api_key.is_empty() {
            debug!("Contact API key not set, skipping person enrichment");
            return Ok(None);
        }
        let cache_key = format!("enrich:person:{}", email.to_ascii_lowercase());
        if let Some(hit) = self.cached(&cache_key).await {
            return Ok(Some(hit));
        }

        let body = self
            .contact_api_post("/people/match", serde_json::json!({ "email": email }))
            .await?;
        let person = &body["person"];
        if person.is_null() || !person.is_object() {
            info!(email, "Person enrichment returned no match");
            return Ok(None);
        }

        let text = |k: &str| person[k].as_str().unwrap_or("").to_string();
        let profile = PersonProfile {
            email: email.to_string(),
            first_name: text("first_name"),
            last_name: text("last_name"),
            title: text("title"),
            seniority: text("seniority"),
            department: person["departments"][0].as_str().unwrap_or("").to_string(),
            linkedin_url: text("linkedin_url"),
            phone_numbers: person["phone_numbers"]
                .as_array()
                .map(|ps| {
                    ps.iter()
                        .filter_map(|p| p["sanitized_number"].as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        self.store_cache(&cache_key, &profile).await;
        Ok(Some(profile))
    }

    async fn enrich_company(&self, domain: &str) -> Result<Option<CompanyProfile>, JobError> {
        if self.config.contact_api_key.is_empty() {
            return Ok(None);
        }
        let domain = clean_domain(domain);
        let cache_key = format!("enrich:company:{}", domain);
        if let Some(hit) = self.cached(&cache_key).await {
            return Ok(Some(hit));
        }

        let body = self
            .contact_api_post(
                "/organizations/enrich",
                serde_json::json!({ "domain": domain }),
            )
            .await?;
        let org = &body["organization"];
        if org.is_null() || !org.is_object() {
            info!(domain, "Company enrichment returned no match");
            return Ok(None);
        }

        let text = |k: &str| org[k].as_str().unwrap_or("").to_string();
        let profile = CompanyProfile {
            name: text("name"),
            domain: domain.clone(),
            employee_count: text("estimated_num_employees"),
            revenue: text("annual_revenue_printed"),
            industry: text("industry"),
            founded_year: org["founded_year"]
                .as_i64()
                .map(|y| y.to_string())
                .unwrap_or_default(),
            funding_stage: text("latest_funding_stage"),
            technologies: org["technology_names"]
                .as_array()
                .map(|ts| {
                    ts.iter()
                        .filter_map(|t| t.as_str())
                        .take(10)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        self.store_cache(&cache_key, &profile).await;
        Ok(Some(profile))
    }

    async fn scrape_homepage_text(&self, domain: &str) -> Result<String, JobError> {
        let domain = clean_domain(domain);
        let url = format!("https://{}", domain);
        let resp = self
            .http
            .get(&url)
            .header("User-Agent", "Mozilla/5.0 (compatible; leadflow/0.4)")
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "scraper"))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status(status, "scraper"));
        }
        let html = resp
            .text()
            .await
            .map_err(|e| JobError::transient(format!("scraper body: {}", e)))?;
        Ok(extract_readable_text(&html))
    }

    async fn fetch_logo(&self, domain: &str) -> Result<Option<Vec<u8>>, JobError> {
        if self.config.logo_api_key.is_empty() {
            return Ok(None);
        }
        let domain = clean_domain(domain);
        let resp = self
            .http
            .get(format!("{}/{}", LOGO_API_BASE, domain))
            .bearer_auth(&self.config.logo_api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "logo fetch"))?;
        let status = resp.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            return Err(classify_status(status, "logo fetch"));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| JobError::transient(format!("logo body: {}", e)))?;

        let Some(url) = pick_logo_url(&body) else {
            info!(domain, "No usable logo format found");
            return Ok(None);
        };
        let image = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "logo download"))?;
        if !image.status().is_success() {
            return Ok(None);
        }
        let bytes = image
            .bytes()
            .await
            .map_err(|e| JobError::transient(format!("logo bytes: {}", e)))?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Prefer a PNG format of the first logo entry, falling back to whatever
/// format is listed first.
fn pick_logo_url(brand: &Value) -> Option<String> {
    let formats = brand["logos"][0]["formats"].as_array()?;
    formats
        .iter()
        .find(|f| f["format"].as_str() == Some("png"))
        .or_else(|| formats.first())
        .and_then(|f| f["src"].as_str())
        .map(str::to_string)
}

/// Strip boilerplate elements and collapse the remaining text.
fn extract_readable_text(html: &str) -> String {
    use scraper::{Html, Selector};

    let document = Html::parse_document(html);
    let noise = Selector::parse("script, style, nav, footer, header, noscript")
        .expect("static selector");
    let noisy_text: std::collections::HashSet<String> = document
        .select(&noise)
        .flat_map(|el| el.text())
        .map(|t| t.trim().to_string())
        .collect();

    let body = Selector::parse("body").expect("static selector");
    let mut lines = Vec::new();
    for el in document.select(&body) {
        for chunk in el.text() {
            let trimmed = chunk.trim();
            if trimmed.is_empty() || noisy_text.contains(trimmed) {
                continue;
            }
            lines.push(trimmed.to_string());
        }
    }
    let mut text = lines.join("\n");
    if text.len() > SCRAPE_TEXT_CAP {
        let mut end = SCRAPE_TEXT_CAP;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
