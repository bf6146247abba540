//! Manual enrichment handler: find-or-create a lead, then fan out over the
//! enrichment sub-steps. Each sub-step is independently best-effort; the
//! handler only fails when every attempted sub-step failed.

use serde_json::{json, Value};
use tracing::{info, warn};

use super::Clients;
use crate::enrich::{CompanyProfile, PersonProfile};
use crate::events::Event;
use crate::intel::WebsiteIntelligence;
use crate::notify::Severity;
use crate::outcome::{HandlerResult, JobError, Outcome};
use crate::util::domain_of_email;

/// Consumer mail providers are never worth enriching as companies.
const PERSONAL_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "icloud.com",
    "me.com",
];

#[derive(Default)]
struct EnrichmentOutcome {
    person: Option<PersonProfile>,
    company: Option<CompanyProfile>,
    website: Option<WebsiteIntelligence>,
    logo: Option<Vec<u8>>,
    sources: Vec<&'static str>,
    failures: Vec<String>,
}

pub async fn enrich_request(event: &Event, clients: &Clients) -> HandlerResult {
    let email = event.payload["email"]
        .as_str()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if email.is_empty() {
        return Err(JobError::permanent("enrichment request missing email"));
    }

    let domain = domain_of_email(&email).unwrap_or_default();
    let personal = PERSONAL_DOMAINS.iter().any(|d| *d == domain);
    if personal {
        info!(email = %email, "Personal email domain; enriching person only");
    }

    let outcome = run_substeps(clients, &email, &domain, personal).await;

    if outcome.sources.is_empty() && !outcome.failures.is_empty() {
        return Err(JobError::permanent(format!(
            "all enrichment sub-steps failed: {}",
            outcome.failures.join("; ")
        )));
    }

    if outcome.sources.is_empty() {
        // Nothing found anywhere; still make sure the lead exists.
        let fallback = json!({
            "Email": email,
            "Last_Name": fallback_last_name(&email),
        });
        let lead_id = clients.crm.upsert_lead_by_email(&email, fallback).await?;
        info!(email = %email, lead_id = %lead_id, "No enrichment data found, created minimal lead");
        return Ok(Outcome::Success);
    }

    let fields = lead_fields(&email, &outcome);
    let lead_id = clients.crm.upsert_lead_by_email(&email, fields).await?;

    clients
        .crm
        .create_note(&lead_id, "Lead Enrichment", &enrichment_note(&outcome))
        .await?;

    if let Some(logo) = &outcome.logo {
        let filename = format!("{}_logo.png", domain);
        if let Err(e) = clients.crm.upload_lead_photo(&lead_id, logo, &filename).await {
            warn!(email = %email, error = %e, "Logo upload failed");
        }
    }

    clients
        .notifier
        .notify_fields(
            "Lead Enrichment Complete",
            &format!("Enrichment finished for {}.", email),
            &[
                ("Email", email.clone()),
                ("Data Sources", outcome.sources.join(", ")),
                ("Lead ID", lead_id),
            ],
            Severity::Info,
        )
        .await;

    Ok(Outcome::Success)
}

async fn run_substeps(
    clients: &Clients,
    email: &str,
    domain: &str,
    personal: bool,
) -> EnrichmentOutcome {
    let mut out = EnrichmentOutcome::default();

    match clients.enrich.enrich_person(email).await {
        Ok(Some(person)) => {
            out.person = Some(person);
            out.sources.push("contact_person");
        }
        Ok(None) => {}
        Err(e) => {
            warn!(email, error = %e, "Person enrichment failed");
            out.failures.push(format!("person: {}", e));
        }
    }

    if !personal && !domain.is_empty() {
        match clients.enrich.enrich_company(domain).await {
            Ok(Some(company)) => {
                out.company = Some(company);
                out.sources.push("contact_company");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(domain, error = %e, "Company enrichment failed");
                out.failures.push(format!("company: {}", e));
            }
        }

        match website_intelligence(clients, domain).await {
            Ok(Some(website)) => {
                out.website = Some(website);
                out.sources.push("website");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(domain, error = %e, "Website analysis failed");
                out.failures.push(format!("website: {}", e));
            }
        }

        match clients.enrich.fetch_logo(domain).await {
            Ok(Some(logo)) => {
                out.logo = Some(logo);
                out.sources.push("logo");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(domain, error = %e, "Logo fetch failed");
                out.failures.push(format!("logo: {}", e));
            }
        }
    }

    out
}

async fn website_intelligence(
    clients: &Clients,
    domain: &str,
) -> Result<Option<WebsiteIntelligence>, JobError> {
    let text = clients.enrich.scrape_homepage_text(domain).await?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let user = format!(
        "Analyze this company homepage text and return a JSON object with \
         exactly these string keys: value_proposition, target_market, \
         products_services, pricing_model, recent_news, growth_signals, \
         key_pain_points, competitors_mentioned, sales_insights. Use an \
         empty string when the page gives no information.\n\n\
         HOMEPAGE TEXT ({}):\n{}",
        domain,
        clients.llm.truncate_input(&text),
    );
    let intel: WebsiteIntelligence = clients
        .llm
        .extract(
            "You are a B2B sales researcher preparing an account brief. \
             Output a single valid JSON object and nothing else.",
            &user,
        )
        .await?;
    if intel.is_empty() {
        return Ok(None);
    }
    Ok(Some(intel))
}

fn lead_fields(email: &str, outcome: &EnrichmentOutcome) -> Value {
    let mut fields = serde_json::Map::new();
    fields.insert("Email".into(), json!(email));

    if let Some(person) = &outcome.person {
        if !person.first_name.is_empty() {
            fields.insert("First_Name".into(), json!(person.first_name));
        }
        if !person.last_name.is_empty() {
            fields.insert("Last_Name".into(), json!(person.last_name));
        }
        if !person.title.is_empty() {
            fields.insert("Job_Title".into(), json!(person.title));
        }
        if !person.seniority.is_empty() {
            fields.insert("Seniority".into(), json!(person.seniority));
        }
        if !person.linkedin_url.is_empty() {
            fields.insert("LinkedIn".into(), json!(person.linkedin_url));
        }
        if let Some(phone) = person.phone_numbers.first() {
            fields.insert("Phone".into(), json!(phone));
        }
    }

    if let Some(company) = &outcome.company {
        if !company.name.is_empty() {
            fields.insert("Company".into(), json!(company.name));
        }
        if !company.employee_count.is_empty() {
            fields.insert("Company_Size".into(), json!(company.employee_count));
        }
        if !company.revenue.is_empty() {
            fields.insert("Company_Revenue".into(), json!(company.revenue));
        }
        if !company.industry.is_empty() {
            fields.insert("Industry".into(), json!(company.industry));
        }
        if !company.technologies.is_empty() {
            fields.insert("Tech_Stack".into(), json!(company.technologies.join(", ")));
        }
    }

    if !fields.contains_key("Last_Name") {
        fields.insert("Last_Name".into(), json!(fallback_last_name(email)));
    }
    Value::Object(fields)
}

fn fallback_last_name(email: &str) -> String {
    let base = domain_of_email(email)
        .and_then(|d| d.split('.').next().map(str::to_string))
        .unwrap_or_else(|| email.split('@').next().unwrap_or("Lead").to_string());
    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => "Lead".to_string(),
    }
}

fn enrichment_note(outcome: &EnrichmentOutcome) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(person) = &outcome.person {
        lines.push("PERSON INTEL".to_string());
        if !person.title.is_empty() {
            lines.push(format!("Job title: {}", person.title));
        }
        if !person.seniority.is_empty() {
            lines.push(format!("Seniority: {}", person.seniority));
        }
        if !person.department.is_empty() {
            lines.push(format!("Department: {}", person.department));
        }
        if !person.linkedin_url.is_empty() {
            lines.push(format!("LinkedIn: {}", person.linkedin_url));
        }
        lines.push(String::new());
    }

    if let Some(company) = &outcome.company {
        lines.push("COMPANY INTEL".to_string());
        if !company.employee_count.is_empty() {
            lines.push(format!("Employees: {}", company.employee_count));
        }
        if !company.revenue.is_empty() {
            lines.push(format!("Revenue: {}", company.revenue));
        }
        if !company.industry.is_empty() {
            lines.push(format!("Industry: {}", company.industry));
        }
        if !company.founded_year.is_empty() {
            lines.push(format!("Founded: {}", company.founded_year));
        }
        if !company.technologies.is_empty() {
            lines.push(format!("Tech stack: {}", company.technologies.join(", ")));
        }
        lines.push(String::new());
    }

    if let Some(web) = &outcome.website {
        lines.push("WEBSITE RESEARCH".to_string());
        let mut section = |label: &str, value: &str| {
            if !value.is_empty() {
                lines.push(format!("{}:\n{}", label, value));
                lines.push(String::new());
            }
        };
        section("What they do", &web.value_proposition);
        section("Who they sell to", &web.target_market);
        section("Products and services", &web.products_services);
        section("Pricing", &web.pricing_model);
        section("Growth signals", &web.growth_signals);
        section("Their customers' pain points", &web.key_pain_points);
        section("How to approach the demo", &web.sales_insights);
    }

    lines.push(format!("Enriched by: {}", outcome.sources.join(", ")));
    lines.join("\n").trim().to_string()
}
