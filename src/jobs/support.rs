//! Support-tool handlers: contact tagging and company usage updates.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{pluck, pluck_str, Clients};
use crate::events::Event;
use crate::notify::Severity;
use crate::outcome::{HandlerResult, JobError, Outcome};
use crate::signals::{detect_signals, signal_task_description, CompanyMetrics};
use crate::util::split_name;

#[derive(Debug, Clone, Default)]
pub struct ContactInfo {
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub contact_id: String,
    pub company_name: String,
    pub company_website: String,
    pub company_size: Option<i64>,
    pub company_industry: String,
    pub custom_attributes: Value,
}

/// The tagged contact rides in `data.item`; newer payloads wrap it in a
/// `contact_tag` object, older ones put the contact at the item itself.
pub fn parse_contact_info(payload: &Value) -> ContactInfo {
    let item = pluck(payload, &["data", "item"]).cloned().unwrap_or(Value::Null);
    let contact = if item["type"].as_str() == Some("contact_tag") {
        item["contact"].clone()
    } else {
        item
    };

    let text = |k: &str| contact[k].as_str().unwrap_or("").trim().to_string();
    let name = text("name");
    let (first_name, last_name) = split_name(&name);

    let company = contact["companies"]["data"][0].clone();
    ContactInfo {
        email: text("email"),
        name,
        first_name,
        last_name,
        phone: text("phone"),
        contact_id: text("id"),
        company_name: company["name"].as_str().unwrap_or("").trim().to_string(),
        company_website: company["website"].as_str().unwrap_or("").trim().to_string(),
        company_size: company["size"].as_i64(),
        company_industry: company["industry"].as_str().unwrap_or("").trim().to_string(),
        custom_attributes: contact["custom_attributes"].clone(),
    }
}

/// Every tag name attached to the contact in the payload.
pub fn extract_tags(payload: &Value) -> Vec<String> {
    let item = pluck(payload, &["data", "item"]).cloned().unwrap_or(Value::Null);
    let tags_obj = if item["type"].as_str() == Some("contact_tag") {
        item["contact"]["tags"].clone()
    } else {
        item["tags"].clone()
    };
    let mut tags: Vec<String> = tags_obj["data"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|t| t["name"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    // The triggering tag itself may not be in the contact's tag list yet.
    if let Some(trigger) = item["tag"]["name"].as_str() {
        if !tags.iter().any(|t| t == trigger) {
            tags.push(trigger.to_string());
        }
    }
    tags
}

pub async fn tag_added(event: &Event, clients: &Clients) -> HandlerResult {
    let info = parse_contact_info(&event.payload);
    if info.email.is_empty() {
        return Err(JobError::permanent("support payload missing contact email"));
    }

    let all_tags = extract_tags(&event.payload);
    let qualifying = &clients.config.sources.qualifying_tags;
    let mut matched: Vec<String> = all_tags
        .iter()
        .filter(|t| qualifying.contains(t))
        .cloned()
        .collect();
    if matched.is_empty() {
        // The webhook fired, so qualify on whatever we have; the tag may have
        // been renamed or removed between delivery and processing.
        warn!(
            contact = %info.contact_id,
            tags = ?all_tags,
            "No qualifying tag on contact, proceeding with first available"
        );
        matched = all_tags.first().cloned().into_iter().collect();
    }

    let config = &clients.config;
    let mut fields = serde_json::Map::new();
    fields.insert("Email".into(), json!(info.email));
    fields.insert("Lead_Status".into(), json!(config.crm.status_qualified));
    fields.insert("Lead_Source".into(), json!("Support"));
    if !info.first_name.is_empty() {
        fields.insert("First_Name".into(), json!(info.first_name));
    }
    if !info.last_name.is_empty() {
        fields.insert("Last_Name".into(), json!(info.last_name));
    } else if !info.first_name.is_empty() {
        let fallback = if info.company_name.is_empty() {
            ".".to_string()
        } else {
            info.company_name.clone()
        };
        fields.insert("Last_Name".into(), json!(fallback));
    }
    if !info.company_name.is_empty() {
        fields.insert("Company".into(), json!(info.company_name));
    }
    if !info.company_website.is_empty() {
        fields.insert("Website".into(), json!(info.company_website));
    }
    if !info.phone.is_empty() {
        fields.insert("Phone".into(), json!(info.phone));
    }
    if !info.company_industry.is_empty() {
        fields.insert("Industry".into(), json!(info.company_industry));
    }
    if let Some(size) = info.company_size {
        fields.insert("No_of_Employees".into(), json!(size));
    }
    if !config.crm.owner_id.is_empty() {
        fields.insert("Owner".into(), json!({ "id": config.crm.owner_id }));
    }

    let lead_id = clients
        .crm
        .upsert_lead_by_email(&info.email, Value::Object(fields))
        .await?;

    clients
        .crm
        .create_note(
            &lead_id,
            "Support Contact Qualified",
            &contact_note(&info, &matched),
        )
        .await?;

    clients
        .notifier
        .notify_fields(
            "Support Contact Qualified",
            &format!(
                "{} from {} qualified via support tagging.",
                if info.name.is_empty() { &info.email } else { &info.name },
                if info.company_name.is_empty() { "an unknown company" } else { &info.company_name },
            ),
            &[
                ("Email", info.email.clone()),
                ("Qualifying Tags", matched.join(", ")),
                ("Lead ID", lead_id),
            ],
            Severity::Info,
        )
        .await;

    Ok(Outcome::Success)
}

fn contact_note(info: &ContactInfo, tags: &[String]) -> String {
    let mut lines = vec![
        "Support contact qualified.".to_string(),
        format!("Contact ID: {}", info.contact_id),
        format!("Qualifying tags: {}", tags.join(", ")),
    ];
    if !info.company_name.is_empty() {
        lines.push(String::new());
        lines.push("Company information:".to_string());
        lines.push(format!("Name: {}", info.company_name));
        if !info.company_website.is_empty() {
            lines.push(format!("Website: {}", info.company_website));
        }
        if let Some(size) = info.company_size {
            lines.push(format!("Size: {} employees", size));
        }
        if !info.company_industry.is_empty() {
            lines.push(format!("Industry: {}", info.company_industry));
        }
    }
    if let Some(attrs) = info.custom_attributes.as_object() {
        if !attrs.is_empty() {
            lines.push(String::new());
            lines.push("Usage attributes:".to_string());
            for (key, value) in attrs {
                if !value.is_null() {
                    lines.push(format!("{}: {}", key, value));
                }
            }
        }
    }
    lines.join("\n")
}

pub async fn company_updated(event: &Event, clients: &Clients) -> HandlerResult {
    let company = pluck(&event.payload, &["data", "item"])
        .cloned()
        .unwrap_or(Value::Null);
    let company_id = company["id"].as_str().unwrap_or("").to_string();
    let company_name = company["name"].as_str().unwrap_or("Unknown Company").to_string();
    let user_count = company["user_count"].as_i64().unwrap_or(0);

    let metrics = CompanyMetrics::from_custom_attributes(&company["custom_attributes"]);
    let signals = detect_signals(&metrics, &clients.config.signals, Utc::now().timestamp());
    if signals.is_empty() {
        info!(company = %company_name, "No signals detected for company update");
        return Ok(Outcome::Success);
    }
    info!(
        company = %company_name,
        count = signals.len(),
        types = ?signals.iter().map(|s| s.signal_type).collect::<Vec<_>>(),
        "Detected company signals"
    );

    let contact_email = pluck_str(&company, &["primary_contact", "email"]);
    let contact_name = pluck_str(&company, &["primary_contact", "name"]).unwrap_or_default();
    let (first, last) = split_name(&contact_name);

    // One lead per company: upsert keyed on the company name so repeated
    // signals from different contacts converge on the same record.
    let mut fields = serde_json::Map::new();
    fields.insert("Company".into(), json!(company_name));
    fields.insert(
        "Last_Name".into(),
        json!(if last.is_empty() {
            if contact_name.is_empty() { "Unknown".to_string() } else { contact_name.clone() }
        } else {
            last
        }),
    );
    if !first.is_empty() {
        fields.insert("First_Name".into(), json!(first));
    }
    fields.insert("Lead_Source".into(), json!("Support - Expansion Signal"));
    if let Some(email) = &contact_email {
        fields.insert("Email".into(), json!(email));
    }
    if user_count > 0 {
        fields.insert("No_of_Employees".into(), json!(user_count));
    }
    let mut description = Vec::new();
    if !metrics.plan.is_empty() {
        description.push(format!("Plan: {}", metrics.plan));
    }
    if metrics.active_projects > 0 || metrics.project_limit > 0 {
        description.push(format!(
            "Active Projects: {}/{}",
            metrics.active_projects, metrics.project_limit
        ));
    }
    if metrics.members > 0 {
        description.push(format!("Team Size: {}", metrics.members));
    }
    if !metrics.subscription_status.is_empty() {
        description.push(format!("Subscription Status: {}", metrics.subscription_status));
    }
    if !description.is_empty() {
        fields.insert("Description".into(), json!(description.join("\n")));
    }

    let lead_id = clients
        .crm
        .upsert_lead_by_company(&company_name, Value::Object(fields))
        .await?;

    let mut note = vec![format!("Detected {} signal(s) for {}:", signals.len(), company_name)];
    for signal in &signals {
        note.push(String::new());
        note.push(format!(
            "[{}] {}",
            signal.priority.as_str().to_uppercase(),
            signal.signal_type.replace('_', " ")
        ));
        note.push(format!("Details: {}", signal.details));
        note.push(format!("Action: {}", signal.action));
    }
    clients
        .crm
        .create_note(&lead_id, "Expansion Signals", &note.join("\n"))
        .await?;

    for signal in &signals {
        if signal.create_task {
            let due = (Utc::now() + Duration::days(signal.urgency_days)).date_naive();
            let subject = format!(
                "{}: {}",
                title_case(&signal.signal_type.replace('_', " ")),
                company_name
            );
            let body = signal_task_description(
                signal,
                &company_name,
                &company_id,
                contact_email.as_deref(),
            );
            if let Err(e) = clients
                .crm
                .create_task(&lead_id, &subject, due, signal.priority.task_priority(), &body)
                .await
            {
                // One failed task should not resurrect every other signal's
                // side effects through a retry.
                warn!(signal = signal.signal_type, error = %e, "Could not create signal task");
            }
        }

        if signal.priority.is_alert_worthy() {
            clients
                .notifier
                .notify_fields(
                    "Expansion Opportunity",
                    &format!("{} for {}", signal.signal_type.replace('_', " "), company_name),
                    &[
                        ("Details", signal.details.clone()),
                        ("Action", signal.action.clone()),
                        (
                            "Contact",
                            contact_email.clone().unwrap_or_else(|| "none on file".to_string()),
                        ),
                    ],
                    if signal.priority == crate::signals::Priority::Critical {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    },
                )
                .await;
        }
    }

    Ok(Outcome::Success)
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;
    use crate::jobs::testing::{harness, harness_with, staged_event};

    fn tag_payload(tag: &str) -> Value {
        json!({
            "topic": "tag_added",
            "created_at": 1_700_000_000,
            "data": {"item": {
                "type": "contact_tag",
                "tag": {"name": tag},
                "contact": {
                    "id": "c-1",
                    "email": "carol@shop.com",
                    "name": "Carol Diaz",
                    "phone": "+1 555 0100",
                    "tags": {"data": [{"name": tag}, {"name": "Newsletter"}]},
                    "companies": {"data": [{
                        "name": "Shopline",
                        "website": "https://shop.com",
                        "size": 40,
                        "industry": "Retail"
                    }]},
                    "custom_attributes": {"plan_type": "Team"}
                }
            }}
        })
    }

    fn company_payload(custom_attrs: Value) -> Value {
        json!({
            "topic": "company_updated",
            "created_at": 1_700_000_000,
            "data": {"item": {
                "id": "comp-1",
                "name": "Shopline",
                "user_count": 42,
                "custom_attributes": custom_attrs,
                "primary_contact": {"email": "carol@shop.com", "name": "Carol Diaz"}
            }}
        })
    }

    fn qualifying_config() -> crate::config::AppConfig {
        let mut config = crate::config::AppConfig::default();
        config.sources.qualifying_tags = vec!["Lead".to_string()];
        config.signals.plans = vec![crate::config::PlanLimits {
            name: "PRO - Yearly".to_string(),
            member_limit: Some(25),
            project_limit: Some(250),
        }];
        config
    }

    #[test]
    fn contact_parsing_handles_both_shapes() {
        let info = parse_contact_info(&tag_payload("Lead"));
        assert_eq!(info.email, "carol@shop.com");
        assert_eq!(info.first_name, "Carol");
        assert_eq!(info.company_name, "Shopline");
        assert_eq!(info.company_size, Some(40));

        let legacy = json!({
            "data": {"item": {
                "id": "c-2",
                "email": "old@shop.com",
                "tags": {"data": [{"name": "Lead"}]}
            }}
        });
        let info = parse_contact_info(&legacy);
        assert_eq!(info.email, "old@shop.com");
        assert_eq!(extract_tags(&legacy), vec!["Lead".to_string()]);
    }

    #[test]
    fn tags_include_the_trigger_tag() {
        let mut payload = tag_payload("Lead");
        payload["data"]["item"]["contact"]["tags"]["data"] = json!([{"name": "Newsletter"}]);
        let tags = extract_tags(&payload);
        assert!(tags.contains(&"Lead".to_string()));
        assert!(tags.contains(&"Newsletter".to_string()));
    }

    #[tokio::test]
    async fn tag_added_upserts_and_notes() {
        let h = harness_with(
            qualifying_config(),
            Default::default(),
            Default::default(),
            vec![],
        );
        let ev = staged_event(
            &h,
            EventSource::SupportTag,
            "tag_added",
            "c-1:1700000000",
            tag_payload("Lead"),
        )
        .await;

        let outcome = tag_added(&ev, &h.clients).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        let writes = h.crm.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert!(writes[0].starts_with("upsert_email:carol@shop.com"));
        assert!(writes[0].contains("\"Lead_Source\":\"Support\""));
        assert!(writes[1].starts_with("note:lead-1:Support Contact Qualified"));
        assert_eq!(h.notify_sink.count(), 1);
    }

    #[tokio::test]
    async fn tag_added_without_email_is_permanent() {
        let h = harness(vec![]);
        let mut payload = tag_payload("Lead");
        payload["data"]["item"]["contact"]["email"] = json!("");
        let ev = staged_event(&h, EventSource::SupportTag, "tag_added", "c-1:0", payload).await;
        let err = tag_added(&ev, &h.clients).await.unwrap_err();
        assert!(matches!(err, JobError::Permanent(_)));
    }

    #[tokio::test]
    async fn company_update_without_signals_is_clean_success() {
        let h = harness_with(
            qualifying_config(),
            Default::default(),
            Default::default(),
            vec![],
        );
        let payload = company_payload(json!({
            "members": 5, "plan": "PRO - Yearly", "subscription_status": "active"
        }));
        let ev = staged_event(
            &h,
            EventSource::SupportCompany,
            "company_updated",
            "comp-1:1700000000",
            payload,
        )
        .await;
        let outcome = company_updated(&ev, &h.clients).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(h.crm.write_count(), 0);
        assert_eq!(h.notify_sink.count(), 0);
    }

    #[tokio::test]
    async fn company_at_capacity_creates_task_and_alert() {
        let h = harness_with(
            qualifying_config(),
            Default::default(),
            Default::default(),
            vec![],
        );
        let payload = company_payload(json!({
            "members": 25, "plan": "PRO - Yearly", "subscription_status": "active"
        }));
        let ev = staged_event(
            &h,
            EventSource::SupportCompany,
            "company_updated",
            "comp-1:1700000000",
            payload,
        )
        .await;

        company_updated(&ev, &h.clients).await.unwrap();

        let writes = h.crm.writes.lock().unwrap();
        assert!(writes[0].starts_with("upsert_company:Shopline"));
        assert!(writes[1].starts_with("note:lead-2:Expansion Signals"));
        assert!(writes
            .iter()
            .any(|w| w.starts_with("task:lead-2:Team At Capacity: Shopline:High")));
        assert_eq!(h.notify_sink.count(), 1);
        let messages = h.notify_sink.messages.lock().unwrap();
        assert!(messages[0].contains("CRITICAL"));
    }

    #[tokio::test]
    async fn low_priority_signals_skip_tasks_and_alerts() {
        let h = harness_with(
            qualifying_config(),
            Default::default(),
            Default::default(),
            vec![],
        );
        let payload = company_payload(json!({
            "members": 5,
            "active_projects": 12,
            "checklists": 0,
            "plan": "PRO - Yearly",
            "subscription_status": "active"
        }));
        let ev = staged_event(
            &h,
            EventSource::SupportCompany,
            "company_updated",
            "comp-1:1700000001",
            payload,
        )
        .await;

        company_updated(&ev, &h.clients).await.unwrap();
        let writes = h.crm.writes.lock().unwrap();
        assert!(!writes.iter().any(|w| w.starts_with("task:")));
        assert_eq!(h.notify_sink.count(), 0);
    }
}
