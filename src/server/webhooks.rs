//! Ingress handlers, one per upstream source.
//!
//! Each handler reads the raw body, verifies the source's signature, parses
//! only the envelope (event type and external id), and hands off to the
//! staging pipeline. Unrecognized event types are acknowledged but never
//! staged; signature failures are rejected before anything is stored.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::AppState;
use crate::events::EventSource;
use crate::jobs::{pluck, pluck_str};
use crate::security::{verify_body_hmac, verify_shared_secret, verify_timestamped_hmac};
use crate::staging::StagingResponse;

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn ignored_response(reason: &str) -> Response {
    Json(json!({ "ok": true, "ignored": true, "reason": reason })).into_response()
}

fn parse_body(raw: &Bytes) -> Result<Value, Response> {
    if raw.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(raw).map_err(|e| {
        warn!(error = %e, "Webhook body is not valid JSON");
        error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e))
    })
}

async fn stage_and_respond(
    state: &AppState,
    source: EventSource,
    event_type: &str,
    external_id: &str,
    payload: &Value,
) -> Response {
    match state
        .staging
        .stage(source, event_type, external_id, payload)
        .await
    {
        Ok(StagingResponse::Queued {
            event_id,
            idempotency_key,
        }) => Json(json!({
            "ok": true,
            "queued": true,
            "event_id": event_id,
            "idempotency_key": idempotency_key,
        }))
        .into_response(),
        Ok(StagingResponse::Duplicate { event_id }) => Json(json!({
            "ok": true,
            "duplicate": true,
            "event_id": event_id,
        }))
        .into_response(),
        Err(e) => {
            warn!(source = %source, error = %e, "Staging failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to stage event")
        }
    }
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// Raw event name plus the type used for processing. A cancellation that is
/// part of a reschedule carries `payload.rescheduled = true` and is handled
/// as `rescheduled`, not `canceled`.
pub fn derive_calendar_event_type(payload: &Value) -> Option<String> {
    let raw = payload["event"].as_str()?;
    if raw == "canceled" && pluck(payload, &["payload", "rescheduled"]) == Some(&json!(true)) {
        return Some("rescheduled".to_string());
    }
    Some(raw.to_string())
}

/// The invitee (or event) URI identifying the physical booking. Both the
/// flattened and the invitee-nested shapes are in the wild.
pub fn extract_calendar_external_id(payload: &Value) -> Option<String> {
    pluck_str(payload, &["payload", "uri"])
        .or_else(|| pluck_str(payload, &["payload", "invitee", "uri"]))
        .or_else(|| pluck_str(payload, &["payload", "uuid"]))
        .or_else(|| pluck_str(payload, &["payload", "invitee", "uuid"]))
        .or_else(|| pluck_str(payload, &["payload", "scheduled_event", "uri"]))
        .or_else(|| pluck_str(payload, &["payload", "event", "uuid"]))
}

pub async fn calendar_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("Calendar-Signature")
        .and_then(|v| v.to_str().ok());
    let check = verify_timestamped_hmac(
        &state.config.sources.calendar_signing_key,
        signature,
        &body,
        Utc::now().timestamp(),
    );
    if !check.is_ok() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            &format!("Invalid signature: {}", check.reason()),
        );
    }

    let payload = match parse_body(&body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let Some(event_type) = derive_calendar_event_type(&payload) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing event type");
    };
    if !matches!(event_type.as_str(), "booked" | "canceled" | "rescheduled") {
        info!(event_type = %event_type, "Unknown calendar event type, acknowledging");
        return ignored_response("unknown_event_type");
    }
    let Some(external_id) = extract_calendar_external_id(&payload) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing external id");
    };

    stage_and_respond(&state, EventSource::Calendar, &event_type, &external_id, &payload).await
}

// ---------------------------------------------------------------------------
// Meeting transcripts
// ---------------------------------------------------------------------------

pub fn extract_meeting_id(payload: &Value) -> Option<String> {
    ["session_id", "sessionId", "meeting_id", "meetingId", "id"]
        .iter()
        .find_map(|k| pluck_str(payload, &[k]))
}

pub fn extract_meeting_duration(payload: &Value) -> i64 {
    let explicit = payload
        .get("duration_minutes")
        .or_else(|| payload.get("duration_min"))
        .or_else(|| payload.get("duration"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if explicit > 0 {
        return explicit;
    }
    let start = pluck_str(payload, &["start_time"]).unwrap_or_default();
    let end = pluck_str(payload, &["end_time"]).unwrap_or_default();
    crate::jobs::meetings::duration_from_times(&start, &end)
}

pub async fn meetings_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provided = headers.get("X-Meeting-Secret").and_then(|v| v.to_str().ok());
    let check = verify_shared_secret(&state.config.sources.meeting_shared_secret, provided);
    if !check.is_ok() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            &format!("Unauthorized: {}", check.reason()),
        );
    }

    let payload = match parse_body(&body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    // Transcript providers name the trigger differently; anything that is
    // not a completed meeting is acknowledged without staging.
    let trigger = pluck_str(&payload, &["trigger"])
        .or_else(|| pluck_str(&payload, &["event_type"]))
        .or_else(|| pluck_str(&payload, &["type"]))
        .unwrap_or_else(|| "completed".to_string());
    if !matches!(trigger.as_str(), "completed" | "meeting_end") {
        return ignored_response("unknown_event_type");
    }

    let Some(meeting_id) = extract_meeting_id(&payload) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing meeting id");
    };

    let duration = extract_meeting_duration(&payload);
    if duration > 0 && duration < state.config.sources.min_duration_minutes {
        info!(meeting_id = %meeting_id, duration, "Meeting below minimum duration");
        return ignored_response("too_short");
    }

    stage_and_respond(
        &state,
        EventSource::MeetingTranscript,
        "completed",
        &meeting_id,
        &payload,
    )
    .await
}

// ---------------------------------------------------------------------------
// Support tool (contact tags and company updates share one endpoint)
// ---------------------------------------------------------------------------

pub async fn support_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("X-Support-Signature")
        .and_then(|v| v.to_str().ok());
    let check = verify_body_hmac(&state.config.sources.support_webhook_secret, signature, &body);
    if !check.is_ok() {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let payload = match parse_body(&body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let topic = payload["topic"].as_str().unwrap_or("");
    let created_at = payload["created_at"].as_i64().unwrap_or(0);

    match topic {
        "tag_added" => {
            let info = crate::jobs::support::parse_contact_info(&payload);
            if info.contact_id.is_empty() {
                return error_response(StatusCode::BAD_REQUEST, "Missing contact id");
            }

            // Filter at the edge when the triggering tag is identifiable; a
            // payload without one is staged and resolved by the handler.
            let trigger_tag = pluck_str(&payload, &["data", "item", "tag", "name"]);
            if let Some(tag) = trigger_tag {
                if !state.config.sources.qualifying_tags.contains(&tag) {
                    info!(tag = %tag, "Tag does not qualify, acknowledging");
                    return ignored_response("tag_not_qualifying");
                }
            }

            let external_id = format!("{}:{}", info.contact_id, created_at);
            stage_and_respond(&state, EventSource::SupportTag, "tag_added", &external_id, &payload)
                .await
        }
        "company_updated" => {
            let Some(company_id) = pluck_str(&payload, &["data", "item", "id"]) else {
                return error_response(StatusCode::BAD_REQUEST, "Missing company id");
            };
            let external_id = format!("{}:{}", company_id, created_at);
            stage_and_respond(
                &state,
                EventSource::SupportCompany,
                "company_updated",
                &external_id,
                &payload,
            )
            .await
        }
        _ => ignored_response("unknown_event_type"),
    }
}

// ---------------------------------------------------------------------------
// Manual enrichment
// ---------------------------------------------------------------------------

pub async fn enrich_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provided = headers.get("X-Enrich-Secret").and_then(|v| v.to_str().ok());
    let check = verify_shared_secret(&state.config.sources.enrich_api_key, provided);
    if !check.is_ok() {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid enrichment secret");
    }

    let payload = match parse_body(&body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let email = payload["email"].as_str().unwrap_or("").trim().to_ascii_lowercase();
    if email.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Email is required");
    }

    let enrich_payload = json!({
        "email": email,
        "lead_id": payload["lead_id"].as_str().unwrap_or(""),
    });
    stage_and_respond(
        &state,
        EventSource::ManualEnrich,
        "enrich_request",
        &email,
        &enrich_payload,
    )
    .await
}
