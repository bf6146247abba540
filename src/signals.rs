//! Expansion and churn signal detection over company usage metrics.
//!
//! `detect_signals` is a pure function of the metrics, the configured plan
//! limits, and the current time; the company-update handler turns its output
//! into CRM tasks and notifier messages. Member limits come from the
//! `[[signals.plans]]` config table, never from payloads; project limits ride
//! along in the usage metrics themselves.

use serde_json::Value;

use crate::config::SignalsConfig;

/// Usage metrics for one company, read from the update payload's custom
/// attributes.
#[derive(Debug, Clone, Default)]
pub struct CompanyMetrics {
    pub members: i64,
    pub active_projects: i64,
    pub project_limit: i64,
    pub plan: String,
    pub subscription_status: String,
    pub subscription_expires_unix: i64,
    pub checklists: i64,
}

impl CompanyMetrics {
    pub fn from_custom_attributes(attrs: &Value) -> Self {
        let int = |k: &str| attrs[k].as_i64().unwrap_or(0);
        let text = |k: &str| attrs[k].as_str().unwrap_or("").to_string();
        Self {
            members: int("members"),
            active_projects: int("active_projects"),
            project_limit: int("project_limit"),
            plan: text("plan"),
            subscription_status: text("subscription_status"),
            subscription_expires_unix: int("subscription_expires_at"),
            checklists: int("checklists"),
        }
    }

    fn is_trial(&self) -> bool {
        matches!(
            self.subscription_status.to_ascii_lowercase().as_str(),
            "trial" | "trialing"
        )
    }

    fn is_churned(&self) -> bool {
        matches!(
            self.subscription_status.to_ascii_lowercase().as_str(),
            "canceled" | "cancelled" | "expired" | "unpaid"
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Task priority label the CRM understands.
    pub fn task_priority(&self) -> &'static str {
        match self {
            Priority::Critical | Priority::High => "High",
            Priority::Medium => "Normal",
            Priority::Low => "Low",
        }
    }

    pub fn is_alert_worthy(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub signal_type: &'static str,
    pub priority: Priority,
    pub details: String,
    pub action: String,
    pub urgency_days: i64,
    pub create_task: bool,
    pub hot_lead: bool,
    pub churn_prevention: bool,
    pub talking_points: Vec<String>,
}

/// Detect every signal the metrics support. Trial-stage companies get the
/// engagement signals and return early; paid companies get the
/// expansion/retention set.
pub fn detect_signals(
    metrics: &CompanyMetrics,
    config: &SignalsConfig,
    now_unix: i64,
) -> Vec<Signal> {
    if metrics.is_trial() {
        return detect_trial_signals(metrics, now_unix);
    }
    detect_paid_signals(metrics, config, now_unix)
}

fn detect_trial_signals(m: &CompanyMetrics, now_unix: i64) -> Vec<Signal> {
    let mut signals = Vec::new();
    let days_until_exp = if m.subscription_expires_unix > 0 {
        Some((m.subscription_expires_unix - now_unix) as f64 / 86_400.0)
    } else {
        None
    };

    if m.active_projects >= 2 && m.members >= 2 {
        signals.push(Signal {
            signal_type: "trial_engaged_user",
            priority: Priority::High,
            details: format!(
                "Trial: {} projects and {} team members, strong engagement",
                m.active_projects, m.members
            ),
            action: "Hot lead: proactive conversion outreach".to_string(),
            urgency_days: 2,
            create_task: true,
            hot_lead: true,
            churn_prevention: false,
            talking_points: vec![
                format!("You've created {} projects and added team members.", m.active_projects),
                "Let's get you set up on a plan.".to_string(),
            ],
        });
    } else if m.active_projects >= 2 {
        signals.push(Signal {
            signal_type: "trial_active_user",
            priority: Priority::Medium,
            details: format!("Trial: {} projects created", m.active_projects),
            action: "Check in and guide toward paid conversion".to_string(),
            urgency_days: 3,
            create_task: true,
            hot_lead: false,
            churn_prevention: false,
            talking_points: vec![format!("I noticed you've created {} projects.", m.active_projects)],
        });
    } else if m.members >= 2 {
        signals.push(Signal {
            signal_type: "trial_team_collaboration",
            priority: Priority::Medium,
            details: format!("Trial: {} team members added, collaboration interest", m.members),
            action: "Show team features, offer team plan".to_string(),
            urgency_days: 3,
            create_task: true,
            hot_lead: false,
            churn_prevention: false,
            talking_points: vec!["Team collaboration is where the product shines.".to_string()],
        });
    }

    if let Some(days) = days_until_exp {
        if days > 0.0 && days <= 2.0 {
            let engaged = m.active_projects >= 1 || m.members >= 2;
            signals.push(Signal {
                signal_type: if engaged {
                    "trial_ending_engaged"
                } else {
                    "trial_ending_inactive"
                },
                priority: if engaged {
                    Priority::High
                } else {
                    Priority::Medium
                },
                details: format!(
                    "Trial ends in {} day(s), {} projects",
                    days as i64, m.active_projects
                ),
                action: if engaged {
                    "Last-chance conversion offer before the trial expires".to_string()
                } else {
                    "Offer help or an extended trial to re-engage".to_string()
                },
                urgency_days: 1,
                create_task: true,
                hot_lead: engaged,
                churn_prevention: false,
                talking_points: vec![format!("Your trial ends in {} day(s).", days as i64)],
            });
        }
    }

    signals
}

fn detect_paid_signals(m: &CompanyMetrics, config: &SignalsConfig, now_unix: i64) -> Vec<Signal> {
    let mut signals = Vec::new();
    let member_limit = config.limits_for(&m.plan).and_then(|p| p.member_limit);

    if let Some(limit) = member_limit.filter(|l| *l > 0) {
        if m.members >= limit {
            signals.push(Signal {
                signal_type: "team_at_capacity",
                priority: Priority::Critical,
                details: format!("{}/{} members, at limit, cannot add more", m.members, limit),
                action: "Offer upgrade with unlimited users".to_string(),
                urgency_days: 2,
                create_task: true,
                hot_lead: true,
                churn_prevention: false,
                talking_points: vec![
                    "You're at your member limit. Are you blocked from adding teammates?"
                        .to_string(),
                ],
            });
        } else if m.members as f64 >= limit as f64 * 0.8 {
            signals.push(Signal {
                signal_type: "team_approaching_capacity",
                priority: Priority::High,
                details: format!(
                    "{}/{} members, {}% of limit",
                    m.members,
                    limit,
                    m.members * 100 / limit
                ),
                action: "Proactive upgrade conversation before the limit hits".to_string(),
                urgency_days: 7,
                create_task: true,
                hot_lead: false,
                churn_prevention: false,
                talking_points: vec![format!(
                    "You're at {} of {} members on the {} plan.",
                    m.members, limit, m.plan
                )],
            });
        }
    }

    if m.active_projects >= 100 {
        signals.push(Signal {
            signal_type: "power_user",
            priority: Priority::High,
            details: format!("{} active projects", m.active_projects),
            action: "Check in about advanced needs and automation".to_string(),
            urgency_days: 14,
            create_task: true,
            hot_lead: false,
            churn_prevention: false,
            talking_points: vec![format!(
                "With {} active projects you're clearly power users.",
                m.active_projects
            )],
        });
    }

    if m.project_limit > 0 && m.active_projects as f64 >= m.project_limit as f64 * 0.8 {
        let near = m.active_projects as f64 >= m.project_limit as f64 * 0.9;
        signals.push(Signal {
            signal_type: "approaching_project_limit",
            priority: if near { Priority::High } else { Priority::Medium },
            details: format!(
                "{}/{} projects, {}% of limit",
                m.active_projects,
                m.project_limit,
                m.active_projects * 100 / m.project_limit
            ),
            action: "Offer a plan with higher project limits".to_string(),
            urgency_days: if near { 7 } else { 14 },
            create_task: true,
            hot_lead: false,
            churn_prevention: false,
            talking_points: Vec::new(),
        });
    }

    if m.subscription_expires_unix > 0 {
        let days = (m.subscription_expires_unix - now_unix) as f64 / 86_400.0;
        if days > 0.0 && days <= 90.0 {
            let soon = days <= 30.0;
            signals.push(Signal {
                signal_type: "subscription_expiring",
                priority: if soon { Priority::High } else { Priority::Medium },
                details: format!("Subscription expires in {} day(s)", days as i64),
                action: "Renewal outreach, explore upsell".to_string(),
                urgency_days: if soon { 7 } else { 14 },
                create_task: true,
                hot_lead: false,
                churn_prevention: false,
                talking_points: Vec::new(),
            });
        }
    }

    if m.is_churned() {
        signals.push(Signal {
            signal_type: "subscription_churned",
            priority: Priority::Critical,
            details: format!("Subscription status: {}", m.subscription_status),
            action: "Win-back campaign, understand why they left".to_string(),
            urgency_days: 1,
            create_task: true,
            hot_lead: false,
            churn_prevention: true,
            talking_points: vec!["Can we schedule a quick call to understand what happened?"
                .to_string()],
        });
    }

    if m.active_projects >= 10 && m.checklists == 0 {
        signals.push(Signal {
            signal_type: "low_feature_adoption",
            priority: Priority::Low,
            details: format!("{} projects but 0 checklists used", m.active_projects),
            action: "Customer success: walk through the checklist feature".to_string(),
            urgency_days: 30,
            create_task: false,
            hot_lead: false,
            churn_prevention: false,
            talking_points: Vec::new(),
        });
    }

    signals
}

/// Structured body for the CRM task created from a signal.
pub fn signal_task_description(
    signal: &Signal,
    company_name: &str,
    company_id: &str,
    contact_email: Option<&str>,
) -> String {
    let mut lines = vec![
        format!("EXPANSION SIGNAL: {}", signal.signal_type.replace('_', " ")),
        String::new(),
        format!("Company: {}", company_name),
    ];
    if let Some(email) = contact_email {
        lines.push(format!("Contact: {}", email));
    }
    lines.push(format!("Company ID: {}", company_id));
    lines.push(String::new());
    lines.push(format!("Details: {}", signal.details));
    lines.push(format!("Action: {}", signal.action));
    lines.push(format!("Contact within {} day(s)", signal.urgency_days));
    if !signal.talking_points.is_empty() {
        lines.push(String::new());
        lines.push("Talking points:".to_string());
        for point in &signal.talking_points {
            lines.push(format!("- {}", point));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanLimits;

    fn config_with_limit(member_limit: i64) -> SignalsConfig {
        SignalsConfig {
            plans: vec![PlanLimits {
                name: "PRO - Yearly".to_string(),
                member_limit: Some(member_limit),
                project_limit: Some(250),
            }],
        }
    }

    fn paid_metrics() -> CompanyMetrics {
        CompanyMetrics {
            plan: "PRO - Yearly".to_string(),
            subscription_status: "active".to_string(),
            ..CompanyMetrics::default()
        }
    }

    fn types(signals: &[Signal]) -> Vec<&'static str> {
        signals.iter().map(|s| s.signal_type).collect()
    }

    #[test]
    fn team_at_capacity_fires_critical_at_limit() {
        let m = CompanyMetrics {
            members: 25,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        assert!(types(&signals).contains(&"team_at_capacity"));
        let sig = signals.iter().find(|s| s.signal_type == "team_at_capacity").unwrap();
        assert_eq!(sig.priority, Priority::Critical);
        assert!(sig.hot_lead);
    }

    #[test]
    fn team_approaching_capacity_fires_at_eighty_percent() {
        let m = CompanyMetrics {
            members: 20,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        assert_eq!(types(&signals), vec!["team_approaching_capacity"]);
        assert_eq!(signals[0].priority, Priority::High);
    }

    #[test]
    fn no_capacity_signal_below_eighty_percent() {
        let m = CompanyMetrics {
            members: 16,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        assert!(!types(&signals).iter().any(|t| t.starts_with("team_")));
    }

    #[test]
    fn power_user_without_project_limit_signal() {
        let m = CompanyMetrics {
            active_projects: 110,
            project_limit: 1000,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        let t = types(&signals);
        assert!(t.contains(&"power_user"));
        assert!(!t.contains(&"approaching_project_limit"));
    }

    #[test]
    fn project_limit_signal_escalates_near_the_cap() {
        let m = CompanyMetrics {
            active_projects: 230,
            project_limit: 250,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        let sig = signals
            .iter()
            .find(|s| s.signal_type == "approaching_project_limit")
            .unwrap();
        assert_eq!(sig.priority, Priority::High);
    }

    #[test]
    fn churned_subscription_is_critical_churn_prevention() {
        let m = CompanyMetrics {
            subscription_status: "canceled".to_string(),
            plan: "PRO - Yearly".to_string(),
            ..CompanyMetrics::default()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        let sig = signals
            .iter()
            .find(|s| s.signal_type == "subscription_churned")
            .unwrap();
        assert_eq!(sig.priority, Priority::Critical);
        assert!(sig.churn_prevention);
    }

    #[test]
    fn trial_signals_short_circuit_paid_signals() {
        let now = 1_700_000_000;
        let m = CompanyMetrics {
            members: 25,
            active_projects: 3,
            plan: "PRO - Yearly".to_string(),
            subscription_status: "trialing".to_string(),
            subscription_expires_unix: now + 86_400,
            ..CompanyMetrics::default()
        };
        let signals = detect_signals(&m, &config_with_limit(25), now);
        let t = types(&signals);
        assert!(t.contains(&"trial_engaged_user"));
        assert!(t.contains(&"trial_ending_engaged"));
        assert!(!t.contains(&"team_at_capacity"));
    }

    #[test]
    fn low_feature_adoption_skips_task_creation() {
        let m = CompanyMetrics {
            active_projects: 12,
            checklists: 0,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        let sig = signals
            .iter()
            .find(|s| s.signal_type == "low_feature_adoption")
            .unwrap();
        assert!(!sig.create_task);
        assert!(!sig.priority.is_alert_worthy());
    }

    #[test]
    fn metrics_parse_from_custom_attributes() {
        let attrs = serde_json::json!({
            "members": 20,
            "active_projects": 110,
            "project_limit": 1000,
            "plan": "PRO - Yearly",
            "subscription_status": "active",
            "subscription_expires_at": 1_700_000_000,
            "checklists": 4,
        });
        let m = CompanyMetrics::from_custom_attributes(&attrs);
        assert_eq!(m.members, 20);
        assert_eq!(m.project_limit, 1000);
        assert_eq!(m.plan, "PRO - Yearly");
    }

    #[test]
    fn task_description_includes_action_and_urgency() {
        let m = CompanyMetrics {
            members: 25,
            ..paid_metrics()
        };
        let signals = detect_signals(&m, &config_with_limit(25), 0);
        let desc = signal_task_description(&signals[0], "Acme", "c-1", Some("a@acme.com"));
        assert!(desc.contains("Company: Acme"));
        assert!(desc.contains("Contact: a@acme.com"));
        assert!(desc.contains("Contact within 2 day(s)"));
    }
}
