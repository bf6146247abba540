//! Meeting-transcript handler: rank attendees, match or create the lead,
//! extract framework-structured qualification data, attach it to the CRM.

use chrono::DateTime;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{format_crm_datetime, pluck_str, Clients};
use crate::events::Event;
use crate::intel::MeetingFramework;
use crate::notify::Severity;
use crate::outcome::{HandlerResult, JobError, Outcome};
use crate::util::{domain_of_email, next_business_day, split_name};

#[derive(Debug, Clone, Default)]
pub struct Attendee {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct MeetingFields {
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub summary: String,
    pub transcript: String,
    pub attendees: Vec<Attendee>,
    pub owner: Option<Attendee>,
    pub duration_minutes: i64,
    pub recording_url: String,
}

pub fn extract_meeting_fields(payload: &Value) -> MeetingFields {
    let text = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| pluck_str(payload, &[k]))
            .unwrap_or_default()
    };

    let title = text(&["title", "meeting_title"]);
    let start_time = text(&["start_time", "datetime", "started_at"]);
    let end_time = text(&["end_time", "ended_at"]);
    let summary = text(&["summary", "meeting_summary"]);
    let recording_url = text(&["recording_url", "recording", "report_url"]);

    let transcript = payload
        .get("transcript")
        .or_else(|| payload.get("meeting_transcript"))
        .map(transcript_to_text)
        .unwrap_or_default();

    let parse_attendee = |v: &Value| Attendee {
        name: v["name"].as_str().unwrap_or("").trim().to_string(),
        email: v["email"].as_str().unwrap_or("").trim().to_string(),
    };
    let attendees = payload
        .get("participants")
        .or_else(|| payload.get("attendees"))
        .and_then(|v| v.as_array())
        .map(|list| list.iter().map(parse_attendee).collect())
        .unwrap_or_default();
    let owner = payload
        .get("owner")
        .filter(|v| v.is_object())
        .map(parse_attendee);

    let mut duration_minutes = payload
        .get("duration_minutes")
        .or_else(|| payload.get("duration_min"))
        .or_else(|| payload.get("duration"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if duration_minutes == 0 {
        duration_minutes = duration_from_times(&start_time, &end_time);
    }

    MeetingFields {
        title,
        start_time,
        end_time,
        summary,
        transcript,
        attendees,
        owner,
        duration_minutes,
        recording_url,
    }
}

pub fn duration_from_times(start: &str, end: &str) -> i64 {
    let parse = |s: &str| DateTime::parse_from_rfc3339(s.trim()).ok();
    match (parse(start), parse(end)) {
        (Some(s), Some(e)) => ((e - s).num_seconds() / 60).max(0),
        _ => 0,
    }
}

/// Flatten a structured transcript (speaker blocks) into `Name: words` lines.
pub fn transcript_to_text(transcript: &Value) -> String {
    if let Some(s) = transcript.as_str() {
        return s.to_string();
    }
    let Some(blocks) = transcript["speaker_blocks"].as_array() else {
        return String::new();
    };
    let mut lines = Vec::new();
    for block in blocks {
        let words = block["words"].as_str().unwrap_or("").trim();
        if words.is_empty() {
            continue;
        }
        let name = block["speaker"]["name"].as_str().unwrap_or("").trim();
        if name.is_empty() {
            lines.push(words.to_string());
        } else {
            lines.push(format!("{}: {}", name, words));
        }
    }
    lines.join("\n")
}

fn is_external_email(email: &str, customer_domains: &[String]) -> bool {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() {
        return false;
    }
    // Room/resource calendar addresses are never leads.
    if email.ends_with("@group.calendar.google.com")
        || email.ends_with("@resource.calendar.google.com")
    {
        return false;
    }
    match domain_of_email(&email) {
        Some(domain) => !customer_domains.iter().any(|d| d.eq_ignore_ascii_case(&domain)),
        None => false,
    }
}

/// All external attendee emails, meeting owner first when external,
/// lowercased and deduplicated in input order.
pub fn rank_external_emails(
    attendees: &[Attendee],
    owner: Option<&Attendee>,
    customer_domains: &[String],
) -> Vec<String> {
    let mut emails: Vec<String> = Vec::new();
    if let Some(owner) = owner {
        if is_external_email(&owner.email, customer_domains) {
            emails.push(owner.email.trim().to_ascii_lowercase());
        }
    }
    for attendee in attendees {
        let email = attendee.email.trim().to_ascii_lowercase();
        if email.is_empty() || emails.contains(&email) {
            continue;
        }
        if is_external_email(&email, customer_domains) {
            emails.push(email);
        }
    }
    emails
}

fn framework_system_prompt() -> &'static str {
    "You are a senior enterprise B2B SaaS sales analyst. Extract CRM-ready \
     qualification data from the meeting transcript. Use only information \
     stated or clearly implied. Output must be a single valid JSON object \
     with no markdown and no text outside it."
}

fn framework_user_prompt(fields: &MeetingFields, transcript: &str) -> String {
    let attendees: Vec<String> = fields
        .attendees
        .iter()
        .map(|a| format!("{} <{}>", a.name, a.email))
        .collect();
    format!(
        "Return a JSON object with exactly these keys: metrics, \
         economic_buyer, decision_criteria, decision_process, \
         identified_pain, champion, competition, next_steps, risks, \
         confidence. List-like fields are single strings with numbered items \
         separated by newline characters; use an empty string for anything \
         not discussed. confidence must be one of \"Cold\", \"Warm\", \
         \"Hot\", \"Super-hot\".\n\n\
         MEETING CONTEXT:\n- Title: {}\n- Date: {}\n- Attendees: {}\n- Summary: {}\n\n\
         TRANSCRIPT:\n{}",
        fields.title,
        fields.start_time,
        attendees.join(", "),
        fields.summary,
        transcript,
    )
}

pub fn framework_lead_fields(framework: &MeetingFramework, status_completed: &str) -> Value {
    let mut fields = serde_json::Map::new();
    fields.insert("Lead_Status".into(), json!(status_completed));
    let mut set_if = |name: &str, value: &str| {
        if !value.is_empty() {
            fields.insert(name.into(), json!(value));
        }
    };
    set_if("Metrics", &framework.metrics);
    set_if("Economic_Buyer", &framework.economic_buyer);
    set_if("Decision_Criteria", &framework.decision_criteria);
    set_if("Decision_Process", &framework.decision_process);
    set_if("Identified_Pain", &framework.identified_pain);
    set_if("Champion", &framework.champion);
    set_if("Competition", &framework.competition);
    fields.insert("Confidence".into(), json!(framework.confidence.as_str()));
    Value::Object(fields)
}

pub async fn completed(event: &Event, clients: &Clients) -> HandlerResult {
    let config = &clients.config;
    let fields = extract_meeting_fields(&event.payload);

    if fields.duration_minutes > 0
        && fields.duration_minutes < config.sources.min_duration_minutes
    {
        return Ok(Outcome::Ignored(format!(
            "too_short: {} minutes",
            fields.duration_minutes
        )));
    }

    let candidates = rank_external_emails(
        &fields.attendees,
        fields.owner.as_ref(),
        &config.sources.customer_domains,
    );
    if candidates.is_empty() {
        return Err(JobError::permanent(
            "no external attendee email available to match a lead",
        ));
    }

    // First candidate with an existing lead wins; otherwise create a fresh
    // lead for the top-ranked external email.
    let mut matched: Option<(String, crate::crm::Lead)> = None;
    for email in &candidates {
        if let Some(lead) = clients.crm.find_lead_by_email(email).await? {
            info!(email = %email, lead_id = %lead.id, "Matched meeting to existing lead");
            matched = Some((email.clone(), lead));
            break;
        }
    }

    let (email, lead_id, existing_demo_date) = match matched {
        Some((email, lead)) => {
            let existing_demo = lead.field_str("Demo_Date").map(str::to_string);
            (email, lead.id, existing_demo)
        }
        None => {
            let email = candidates[0].clone();
            debug!(email = %email, "No existing lead matched, creating one");
            let attendee_name = fields
                .attendees
                .iter()
                .find(|a| a.email.eq_ignore_ascii_case(&email))
                .map(|a| a.name.clone())
                .unwrap_or_default();
            let (first, last) = split_name(&attendee_name);

            let mut create = serde_json::Map::new();
            create.insert("Email".into(), json!(email));
            create.insert("Lead_Status".into(), json!(config.crm.status_completed));
            create.insert(
                "Last_Name".into(),
                json!(if last.is_empty() {
                    ".".to_string()
                } else {
                    truncate_name(&last)
                }),
            );
            if !first.is_empty() {
                create.insert("First_Name".into(), json!(truncate_name(&first)));
            }
            if let Some(demo) = format_crm_datetime(&fields.start_time) {
                create.insert("Demo_Date".into(), json!(demo));
            }
            let lead_id = clients
                .crm
                .upsert_lead_by_email(&email, Value::Object(create))
                .await?;
            clients
                .crm
                .create_note(
                    &lead_id,
                    "Lead Created From Meeting",
                    &format!("Created because no existing lead matched attendee email: {}", email),
                )
                .await?;
            (email, lead_id, None)
        }
    };

    let transcript = clients.llm.truncate_input(&fields.transcript);
    let framework: MeetingFramework = clients
        .llm
        .extract(
            framework_system_prompt(),
            &framework_user_prompt(&fields, &transcript),
        )
        .await?;

    let mut update = framework_lead_fields(&framework, &config.crm.status_completed);
    if let Some(map) = update.as_object_mut() {
        map.insert("Email".into(), json!(email));
        // A demo date written at booking time wins over the meeting start
        // when the preserve policy is on.
        let keep_existing =
            config.crm.preserve_existing_demo_date && existing_demo_date.is_some();
        if !keep_existing {
            if let Some(demo) = format_crm_datetime(&fields.start_time) {
                map.insert("Demo_Date".into(), json!(demo));
            }
        }
    }
    clients.crm.upsert_lead_by_email(&email, update).await?;

    clients
        .crm
        .create_note(
            &lead_id,
            &format!("Meeting Summary - {}", fields.title),
            &framework.to_note_content(&fields.recording_url),
        )
        .await?;

    if config.crm.create_followup_task {
        let body = format!("Next steps:\n{}", framework.next_steps);
        clients
            .crm
            .create_task(
                &lead_id,
                "Follow up after demo",
                next_business_day(),
                "High",
                body.trim(),
            )
            .await?;
    }

    clients
        .notifier
        .notify_fields(
            "Demo Completed",
            &format!("Meeting analysis for {} added to the CRM.", email),
            &[
                ("Email", email.clone()),
                ("Duration", format!("{} minutes", fields.duration_minutes)),
                ("Confidence", framework.confidence.as_str().to_string()),
                ("Lead ID", lead_id),
            ],
            Severity::Info,
        )
        .await;

    Ok(Outcome::Success)
}

/// The CRM caps name fields at 40 characters.
fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(40);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
