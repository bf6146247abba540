//! Typed records extracted by the LLM.
//!
//! Each record mirrors the runtime-validated schema sent to the model: closed
//! records with optional string fields, so a sparse extraction still
//! validates and the CRM mapping layer decides what is worth writing.

use serde::Deserialize;

/// Lead intelligence extracted from a booking payload (invitee details plus
/// the question-and-answer form).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingIntel {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub company_website: String,
    #[serde(default)]
    pub company_type: String,
    #[serde(default)]
    pub company_description: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub team_size: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state_or_region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub referred_by: String,
    #[serde(default)]
    pub tools_in_use: String,
    #[serde(default)]
    pub stated_pain_points: String,
    #[serde(default)]
    pub stated_demo_objectives: String,
    #[serde(default)]
    pub additional_notes: String,
    #[serde(default)]
    pub demo_datetime_utc: String,
    #[serde(default)]
    pub demo_datetime_local: String,
    #[serde(default)]
    pub bant_budget_signal: String,
    #[serde(default)]
    pub bant_authority_signal: String,
    #[serde(default)]
    pub bant_need_signal: String,
    #[serde(default)]
    pub bant_timing_signal: String,
    #[serde(default)]
    pub qualification_gaps: String,
    #[serde(default)]
    pub recommended_discovery_questions: String,
    #[serde(default)]
    pub demo_focus_recommendations: String,
    #[serde(default)]
    pub sales_rep_cheat_sheet: String,
}

impl BookingIntel {
    /// Compact text block for the CRM note attached to a booking.
    pub fn to_note_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let discussed = |s: &str| !s.is_empty() && s != "Not discussed";

        if discussed(&self.company_name) || discussed(&self.company_type) {
            parts.push(format!("Company: {} ({})", self.company_name, self.company_type));
        }
        if discussed(&self.company_description) {
            parts.push(format!("Description: {}", self.company_description));
        }
        if discussed(&self.team_size) {
            parts.push(format!("Team Size: {}", self.team_size));
        }
        if discussed(&self.tools_in_use) {
            parts.push(format!("Tools in Use: {}", self.tools_in_use));
        }
        if discussed(&self.stated_pain_points) {
            parts.push(format!("Pain Points:\n{}", self.stated_pain_points));
        }
        if discussed(&self.stated_demo_objectives) {
            parts.push(format!("Demo Objectives:\n{}", self.stated_demo_objectives));
        }
        parts.join("\n\n")
    }
}

/// Qualification confidence, validated as part of the schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Confidence {
    #[default]
    Cold,
    Warm,
    Hot,
    #[serde(rename = "Super-hot")]
    SuperHot,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Cold => "Cold",
            Confidence::Warm => "Warm",
            Confidence::Hot => "Hot",
            Confidence::SuperHot => "Super-hot",
        }
    }
}

/// Framework-structured qualification data extracted from a meeting
/// transcript.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeetingFramework {
    #[serde(default)]
    pub metrics: String,
    #[serde(default)]
    pub economic_buyer: String,
    #[serde(default)]
    pub decision_criteria: String,
    #[serde(default)]
    pub decision_process: String,
    #[serde(default)]
    pub identified_pain: String,
    #[serde(default)]
    pub champion: String,
    #[serde(default)]
    pub competition: String,
    #[serde(default)]
    pub next_steps: String,
    #[serde(default)]
    pub risks: String,
    #[serde(default)]
    pub confidence: Confidence,
}

impl MeetingFramework {
    pub fn to_note_content(&self, recording_url: &str) -> String {
        let mut lines: Vec<String> = vec![format!("Confidence: {}", self.confidence.as_str()), String::new()];
        let mut section = |title: &str, body: &str| {
            if !body.is_empty() {
                lines.push(format!("{}:\n{}", title, body));
                lines.push(String::new());
            }
        };
        section("Metrics", &self.metrics);
        section("Economic buyer", &self.economic_buyer);
        section("Decision criteria", &self.decision_criteria);
        section("Decision process", &self.decision_process);
        section("Identified pain", &self.identified_pain);
        section("Champion", &self.champion);
        section("Competition", &self.competition);
        section("Next steps", &self.next_steps);
        section("Risks", &self.risks);
        if !recording_url.is_empty() {
            lines.push(format!("Recording: {}", recording_url));
        }
        lines.join("\n").trim().to_string()
    }
}

/// LLM analysis of a scraped company website.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebsiteIntelligence {
    #[serde(default)]
    pub value_proposition: String,
    #[serde(default)]
    pub target_market: String,
    #[serde(default)]
    pub products_services: String,
    #[serde(default)]
    pub pricing_model: String,
    #[serde(default)]
    pub recent_news: String,
    #[serde(default)]
    pub growth_signals: String,
    #[serde(default)]
    pub key_pain_points: String,
    #[serde(default)]
    pub competitors_mentioned: String,
    #[serde(default)]
    pub sales_insights: String,
}

impl WebsiteIntelligence {
    pub fn is_empty(&self) -> bool {
        [
            &self.value_proposition,
            &self.target_market,
            &self.products_services,
            &self.pricing_model,
            &self.recent_news,
            &self.growth_signals,
            &self.key_pain_points,
            &self.competitors_mentioned,
            &self.sales_insights,
        ]
        .iter()
        .all(|s| s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_intel_validates_from_sparse_json() {
        let intel: BookingIntel =
            serde_json::from_str(r#"{"first_name": "Isabelle", "company_name": "Leapzone"}"#)
                .unwrap();
        assert_eq!(intel.first_name, "Isabelle");
        assert_eq!(intel.last_name, "");
    }

    #[test]
    fn confidence_rejects_unknown_levels() {
        assert!(serde_json::from_str::<Confidence>("\"Super-hot\"").is_ok());
        assert!(serde_json::from_str::<Confidence>("\"Lukewarm\"").is_err());
    }

    #[test]
    fn note_text_skips_undiscussed_fields() {
        let intel = BookingIntel {
            company_name: "Acme".into(),
            company_type: "SaaS".into(),
            stated_pain_points: "1. Slow approvals".into(),
            team_size: "Not discussed".into(),
            ..BookingIntel::default()
        };
        let note = intel.to_note_text();
        assert!(note.contains("Company: Acme (SaaS)"));
        assert!(note.contains("Pain Points:\n1. Slow approvals"));
        assert!(!note.contains("Team Size"));
    }

    #[test]
    fn framework_note_sections_render_in_order() {
        let fw = MeetingFramework {
            metrics: "1. Cut review time".into(),
            next_steps: "1. Send pricing".into(),
            confidence: Confidence::Hot,
            ..MeetingFramework::default()
        };
        let note = fw.to_note_content("https://example.com/rec");
        assert!(note.starts_with("Confidence: Hot"));
        let metrics_at = note.find("Metrics:").unwrap();
        let steps_at = note.find("Next steps:").unwrap();
        assert!(metrics_at < steps_at);
        assert!(note.ends_with("Recording: https://example.com/rec"));
    }

    #[test]
    fn website_intelligence_empty_check() {
        assert!(WebsiteIntelligence::default().is_empty());
        let wi = WebsiteIntelligence {
            value_proposition: "Faster reviews".into(),
            ..WebsiteIntelligence::default()
        };
        assert!(!wi.is_empty());
    }
}
