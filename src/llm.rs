//! Outbound LLM client: generate, validate against a typed record, repair.
//!
//! The extraction contract is strict JSON. Models wrap output in code fences
//! or a single-key envelope often enough that we strip both before parsing.
//! A failed validation gets exactly one repair attempt carrying the prior
//! output and the validation error; a second failure is permanent
//! (`llm_schema_invalid`). Transport failures are transient and surface to
//! the queue for retry, outside the two-attempt cap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::outcome::{classify_reqwest, JobError};

pub const SCHEMA_INVALID: &str = "llm_schema_invalid";

/// Marker inserted between the head and tail of a truncated prompt.
const ELISION_MARKER: &str = "\n\n[--- middle truncated ---]\n\n";

/// Raw generation seam; the validation loop sits on top.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, JobError>;
}

/// Generative Language API transport.
pub struct GeminiTransport {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl GeminiTransport {
    pub fn new(config: &LlmConfig, request_timeout: Duration) -> Self {
        Self {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl LlmTransport for GeminiTransport {
    async fn generate(&self, system: &str, user: &str) -> Result<String, JobError> {
        if self.api_key.is_empty() {
            return Err(JobError::permanent("llm api_key not configured"));
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let payload = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
            "generationConfig": { "temperature": 0.3, "maxOutputTokens": 8192 },
        });

        info!(model = %self.model, user_len = user.len(), "Calling LLM");
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "llm"))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(crate::outcome::classify_status(status, "llm"));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| JobError::transient(format!("llm response body: {}", e)))?;
        let text = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                JobError::permanent(format!(
                    "unexpected llm response shape: {}",
                    crate::util::truncate_for_log(&body.to_string(), 300)
                ))
            })?;

        let finish_reason = body["candidates"][0]["finishReason"].as_str().unwrap_or("UNKNOWN");
        if finish_reason != "STOP" {
            warn!(finish_reason, "LLM response may be incomplete");
        }
        Ok(text.to_string())
    }
}

pub struct LlmClient {
    transport: Arc<dyn LlmTransport>,
    prompt_char_budget: usize,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn LlmTransport>, prompt_char_budget: usize) -> Self {
        Self {
            transport,
            prompt_char_budget,
        }
    }

    /// Generate and validate a typed record, with one repair round for schema
    /// failures.
    pub async fn extract<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T, JobError> {
        let raw1 = self.transport.generate(system_prompt, user_prompt).await?;
        let json1 = extract_json_object(&raw1);
        match parse_validated::<T>(&json1) {
            Ok(v) => {
                debug!("LLM output validated on first attempt");
                return Ok(v);
            }
            Err(e1) => {
                warn!(error = %e1, "LLM output failed validation, attempting repair");
                let repair_user = format!(
                    "Fix this JSON to match the schema exactly. Output JSON only.\n\n\
                     Validation errors:\n{}\n\nInvalid JSON:\n{}",
                    crate::util::truncate_for_log(&e1, 1200),
                    json1,
                );
                let raw2 = self.transport.generate(system_prompt, &repair_user).await?;
                let json2 = extract_json_object(&raw2);
                match parse_validated::<T>(&json2) {
                    Ok(v) => {
                        info!("LLM output validated after repair");
                        Ok(v)
                    }
                    Err(e2) => {
                        warn!(error = %e2, "LLM output invalid after repair");
                        Err(JobError::permanent(SCHEMA_INVALID))
                    }
                }
            }
        }
    }

    /// Deterministic head+tail truncation for very large inputs: keep the
    /// first and last half of the budget with an elision marker between.
    pub fn truncate_input(&self, input: &str) -> String {
        truncate_head_tail(input, self.prompt_char_budget)
    }
}

pub fn truncate_head_tail(input: &str, budget: usize) -> String {
    let trimmed = input.trim();
    if trimmed.len() <= budget || budget < 2 {
        return trimmed.to_string();
    }
    let half = budget / 2;
    let head_end = floor_char_boundary(trimmed, half);
    let tail_start = ceil_char_boundary(trimmed, trimmed.len() - half);
    format!(
        "{}{}{}",
        &trimmed[..head_end],
        ELISION_MARKER,
        &trimmed[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Pull one JSON object out of model output, tolerating markdown code fences
/// and leading prose.
pub fn extract_json_object(text: &str) -> String {
    let mut s = text.trim();

    if let Some(stripped) = s.strip_prefix("```") {
        if let Some(end) = stripped.find("```") {
            s = stripped[..end].trim();
            s = s
                .strip_prefix("json")
                .or_else(|| s.strip_prefix("JSON"))
                .unwrap_or(s)
                .trim();
        }
    }

    let Some(start) = s.find('{') else {
        return s.to_string();
    };

    // Match braces so trailing commentary after the object is dropped.
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return s[start..start + i + 1].to_string();
                }
            }
            _ => {}
        }
    }

    // Unbalanced; fall back to the widest brace span.
    match s.rfind('}') {
        Some(end) if end > start => s[start..=end].to_string(),
        _ => s.to_string(),
    }
}

/// Parse and validate, normalizing two habits the strict schema would
/// otherwise reject: a single-key wrapper object, and nulls where the record
/// expects strings.
fn parse_validated<T: DeserializeOwned>(json: &str) -> Result<T, String> {
    let mut value: Value = serde_json::from_str(json).map_err(|e| e.to_string())?;

    if let Some(obj) = value.as_object() {
        if obj.len() == 1 {
            let inner = obj.values().next().unwrap();
            if inner.is_object() {
                let mut unwrapped = inner.clone();
                nulls_to_empty(&mut unwrapped);
                if let Ok(v) = serde_json::from_value::<T>(unwrapped) {
                    return Ok(v);
                }
            }
        }
    }

    nulls_to_empty(&mut value);
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn nulls_to_empty(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        for v in obj.values_mut() {
            if v.is_null() {
                *v = Value::String(String::new());
            }
        }
    }
}
