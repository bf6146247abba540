//! Calendar booking handlers: booked, canceled, rescheduled.

use serde_json::{json, Value};
use tracing::info;

use super::{format_crm_datetime, pluck, pluck_str, Clients};
use crate::events::{Event, EventSource};
use crate::intel::BookingIntel;
use crate::notify::Severity;
use crate::outcome::{HandlerResult, JobError, Outcome};
use crate::util::{qa_to_text, split_name};

/// Envelope details extracted from a calendar payload. The booking body comes
/// in both a flattened and an invitee-nested shape.
#[derive(Debug, Clone, Default)]
pub struct BookingInfo {
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub demo_datetime: String,
    pub demo_timezone: String,
    pub invitee_uri: String,
    pub event_uri: String,
    pub qa_text: String,
    pub phone: String,
}

pub fn parse_booking_info(payload: &Value) -> BookingInfo {
    let email = pluck_str(payload, &["payload", "email"])
        .or_else(|| pluck_str(payload, &["payload", "invitee", "email"]))
        .unwrap_or_default();
    let name = pluck_str(payload, &["payload", "name"])
        .or_else(|| pluck_str(payload, &["payload", "invitee", "name"]))
        .unwrap_or_default();
    let invitee_uri = pluck_str(payload, &["payload", "uri"])
        .or_else(|| pluck_str(payload, &["payload", "invitee", "uri"]))
        .unwrap_or_default();

    let (event_uri, demo_datetime, demo_timezone) =
        if let Some(scheduled) = pluck(payload, &["payload", "scheduled_event"]) {
            (
                pluck_str(scheduled, &["uri"]).unwrap_or_default(),
                pluck_str(scheduled, &["start_time"]).unwrap_or_default(),
                pluck_str(scheduled, &["timezone"]).unwrap_or_default(),
            )
        } else {
            (
                pluck_str(payload, &["payload", "event", "uri"]).unwrap_or_default(),
                pluck_str(payload, &["payload", "event", "start_time"]).unwrap_or_default(),
                pluck_str(payload, &["payload", "event", "timezone"]).unwrap_or_default(),
            )
        };

    let qa_text = pluck(payload, &["payload", "questions_and_answers"])
        .map(qa_to_text)
        .unwrap_or_default();
    let phone = pluck_str(payload, &["payload", "text_reminder_number"])
        .or_else(|| pluck_str(payload, &["payload", "invitee", "text_reminder_number"]))
        .unwrap_or_default();

    let (first_name, last_name) = split_name(&name);
    BookingInfo {
        email,
        name,
        first_name,
        last_name,
        demo_datetime,
        demo_timezone,
        invitee_uri,
        event_uri,
        qa_text,
        phone,
    }
}

fn extraction_system_prompt() -> &'static str {
    "You are a senior B2B SaaS sales analyst. Extract CRM-ready lead \
     intelligence from the booking data provided. Use only information stated \
     or clearly implied; never invent facts. Output must be a single valid \
     JSON object with no markdown and no commentary."
}

fn extraction_user_prompt(info: &BookingInfo) -> String {
    let mut lines = vec![
        format!("Name of person booking the demo: {}", info.name),
        format!("Email: {}", info.email),
    ];
    if !info.phone.is_empty() {
        lines.push(format!("Phone: {}", info.phone));
    }
    if !info.qa_text.is_empty() {
        lines.push(format!("Questions and answers:\n{}", info.qa_text));
    }
    if !info.demo_timezone.is_empty() {
        lines.push(format!("Timezone: {}", info.demo_timezone));
    }
    if !info.demo_datetime.is_empty() {
        lines.push(format!("Demo start time: {}", info.demo_datetime));
    }

    format!(
        "Extract lead intelligence from the booking data below. Derive the \
         company from the email domain (empty website for personal email \
         providers), infer location only from the timezone, and use an empty \
         string for anything not determinable.\n\n\
         Return a JSON object with exactly these keys, all string-valued: \
         first_name, last_name, company_name, company_website, company_type, \
         company_description, industry, team_size, country, state_or_region, \
         city, phone, referred_by, tools_in_use, stated_pain_points, \
         stated_demo_objectives, additional_notes, demo_datetime_utc, \
         demo_datetime_local, bant_budget_signal, bant_authority_signal, \
         bant_need_signal, bant_timing_signal, qualification_gaps, \
         recommended_discovery_questions, demo_focus_recommendations, \
         sales_rep_cheat_sheet.\n\n\
         BOOKING DATA:\n{}",
        lines.join("\n")
    )
}

/// Map parsed info plus extracted intel onto CRM lead fields.
pub fn build_lead_fields(
    info: &BookingInfo,
    lead_status: &str,
    intel: &BookingIntel,
    owner_id: &str,
) -> Value {
    let mut fields = serde_json::Map::new();
    let discussed = |s: &str| !s.is_empty() && s != "Not discussed" && s != "Unknown";

    fields.insert("Email".into(), json!(info.email));
    fields.insert("Lead_Status".into(), json!(lead_status));
    fields.insert("Lead_Source".into(), json!("Calendar"));

    let first = if !intel.first_name.is_empty() {
        intel.first_name.clone()
    } else {
        info.first_name.clone()
    };
    let last = if !intel.last_name.is_empty() {
        intel.last_name.clone()
    } else {
        info.last_name.clone()
    };
    if !first.is_empty() {
        fields.insert("First_Name".into(), json!(first));
    }
    if !last.is_empty() {
        fields.insert("Last_Name".into(), json!(last));
    } else if !first.is_empty() {
        // The CRM requires a last name; fall back to the company or a dot.
        let fallback = if discussed(&intel.company_name) {
            intel.company_name.clone()
        } else {
            ".".to_string()
        };
        fields.insert("Last_Name".into(), json!(fallback));
    }

    let mut set_if = |name: &str, value: &str| {
        if discussed(value) {
            fields.insert(name.into(), json!(value.trim()));
        }
    };
    set_if("Company", &intel.company_name);
    set_if("Website", &intel.company_website);
    set_if("Industry", &intel.industry);
    set_if("Country", &intel.country);
    set_if("State", &intel.state_or_region);
    set_if("City", &intel.city);
    set_if("Team_Size", &intel.team_size);
    set_if("Tools_In_Use", &intel.tools_in_use);
    set_if("Pain_Points", &intel.stated_pain_points);
    set_if("Demo_Objectives", &intel.stated_demo_objectives);
    set_if("Discovery_Questions", &intel.recommended_discovery_questions);
    set_if("Demo_Focus", &intel.demo_focus_recommendations);
    set_if("Sales_Cheat_Sheet", &intel.sales_rep_cheat_sheet);
    set_if("Referred_By", &intel.referred_by);

    let phone = if !info.phone.is_empty() {
        info.phone.clone()
    } else {
        intel.phone.clone()
    };
    if discussed(&phone) {
        fields.insert("Phone".into(), json!(phone.trim()));
    }

    let demo_source = if !intel.demo_datetime_utc.is_empty() {
        intel.demo_datetime_utc.as_str()
    } else {
        info.demo_datetime.as_str()
    };
    if let Some(formatted) = format_crm_datetime(demo_source) {
        fields.insert("Demo_Date".into(), json!(formatted));
    }
    if !info.demo_timezone.is_empty() {
        fields.insert("Demo_Timezone".into(), json!(info.demo_timezone));
    }
    if !owner_id.is_empty() {
        fields.insert("Owner".into(), json!({ "id": owner_id }));
    }

    Value::Object(fields)
}

pub async fn booked(event: &Event, clients: &Clients) -> HandlerResult {
    let info = parse_booking_info(&event.payload);
    if info.email.is_empty() {
        return Err(JobError::permanent("booking payload missing invitee email"));
    }

    let intel: BookingIntel = clients
        .llm
        .extract(extraction_system_prompt(), &extraction_user_prompt(&info))
        .await?;

    let config = &clients.config;
    let fields = build_lead_fields(&info, &config.crm.status_booked, &intel, &config.crm.owner_id);
    let lead_id = clients.crm.upsert_lead_by_email(&info.email, fields).await?;

    let mut note = Vec::new();
    if !info.demo_datetime.is_empty() {
        let local = if !intel.demo_datetime_local.is_empty()
            && intel.demo_datetime_local != "Not discussed"
        {
            intel.demo_datetime_local.clone()
        } else {
            format!("{} ({})", info.demo_datetime, info.demo_timezone)
        };
        note.push(format!("Demo datetime: {}", local));
    }
    if !info.qa_text.is_empty() {
        note.push(format!("\nQ&A:\n{}", info.qa_text));
    }
    let intel_text = intel.to_note_text();
    if !intel_text.is_empty() {
        note.push(format!("\nLead intel:\n{}", intel_text));
    }
    clients
        .crm
        .create_note(&lead_id, "Demo Booked", note.join("\n").trim())
        .await?;

    clients
        .notifier
        .notify_fields(
            "New Demo Booked",
            &format!(
                "{} from {} booked a demo.",
                or_unknown(&info.name, &info.email),
                or_unknown(&intel.company_name, "an unknown company")
            ),
            &[
                ("Email", info.email.clone()),
                ("Demo Date", info.demo_datetime.clone()),
                ("Lead ID", lead_id.clone()),
            ],
            Severity::Info,
        )
        .await;

    // Follow-up enrichment runs as its own job under a distinct fingerprint,
    // so a retry of this event never re-runs the enrichment fan-out.
    if clients.config.enrich.auto_enrich_after_booking {
        let enrich_payload = json!({ "email": info.email, "lead_id": lead_id });
        if let Err(e) = clients
            .staging
            .stage(
                EventSource::ManualEnrich,
                "enrich_request",
                &info.email.to_ascii_lowercase(),
                &enrich_payload,
            )
            .await
        {
            // Best-effort: the booking itself succeeded.
            tracing::warn!(email = %info.email, error = %e, "Could not enqueue follow-up enrichment");
        } else {
            info!(email = %info.email, "Follow-up enrichment queued");
        }
    }

    Ok(Outcome::Success)
}

pub async fn canceled(event: &Event, clients: &Clients) -> HandlerResult {
    let info = parse_booking_info(&event.payload);
    if info.email.is_empty() {
        return Err(JobError::permanent("booking payload missing invitee email"));
    }

    // No extraction for cancellations; status flip plus an audit note.
    let config = &clients.config;
    let fields = build_lead_fields(
        &info,
        &config.crm.status_canceled,
        &BookingIntel::default(),
        &config.crm.owner_id,
    );
    let lead_id = clients.crm.upsert_lead_by_email(&info.email, fields).await?;
    clients
        .crm
        .create_note(
            &lead_id,
            "Demo Canceled",
            &format!(
                "Cancellation received.\nInvitee: {}\nInvitee URI: {}",
                info.email, info.invitee_uri
            ),
        )
        .await?;

    clients
        .notifier
        .notify_fields(
            "Demo Canceled",
            &format!("{} canceled their demo.", or_unknown(&info.name, &info.email)),
            &[("Email", info.email.clone()), ("Lead ID", lead_id)],
            Severity::Warning,
        )
        .await;

    Ok(Outcome::Success)
}

pub async fn rescheduled(event: &Event, clients: &Clients) -> HandlerResult {
    let info = parse_booking_info(&event.payload);
    if info.email.is_empty() {
        return Err(JobError::permanent("booking payload missing invitee email"));
    }

    let intel: BookingIntel = clients
        .llm
        .extract(extraction_system_prompt(), &extraction_user_prompt(&info))
        .await?;

    let config = &clients.config;
    let fields = build_lead_fields(&info, &config.crm.status_booked, &intel, &config.crm.owner_id);
    let lead_id = clients.crm.upsert_lead_by_email(&info.email, fields).await?;

    let demo = if !intel.demo_datetime_local.is_empty()
        && intel.demo_datetime_local != "Not discussed"
    {
        intel.demo_datetime_local.clone()
    } else {
        format!("{} ({})", info.demo_datetime, info.demo_timezone)
    };
    clients
        .crm
        .create_note(
            &lead_id,
            "Demo Rescheduled",
            &format!("Reschedule received.\nNew demo datetime: {}", demo),
        )
        .await?;

    Ok(Outcome::Success)
}

fn or_unknown<'a>(primary: &'a str, fallback: &'a str) -> &'a str {
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}
