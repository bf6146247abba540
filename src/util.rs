//! Small shared helpers used across handlers and clients.

use chrono::{Datelike, Duration, NaiveDate, Utc};

/// Extract the domain part of an email address, lowercased.
/// `"John@Acme.com"` -> `"acme.com"`.
pub fn domain_of_email(email: &str) -> Option<String> {
    let (_, domain) = email.split_once('@')?;
    let domain = domain.trim().to_ascii_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Strip protocol, `www.` prefix and trailing slashes from a domain-ish string.
pub fn clean_domain(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_end_matches('/')
        .to_string()
}

/// Render a list of non-empty items as a numbered list, one per line.
pub fn numbered_bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty())
        .enumerate()
        .map(|(idx, val)| format!("{}. {}", idx + 1, val))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Flatten a `questions_and_answers` array into numbered `question: answer` lines.
pub fn qa_to_text(qa: &serde_json::Value) -> String {
    let Some(items) = qa.as_array() else {
        return String::new();
    };
    let mut lines = Vec::new();
    for item in items {
        let q = item["question"].as_str().unwrap_or("").trim();
        let a = item["answer"].as_str().unwrap_or("").trim();
        match (q.is_empty(), a.is_empty()) {
            (false, false) => lines.push(format!("{}: {}", q, a)),
            (false, true) => lines.push(q.to_string()),
            (true, false) => lines.push(a.to_string()),
            (true, true) => {}
        }
    }
    numbered_bullets(&lines)
}

/// The next weekday strictly after today (UTC). Used for follow-up task due dates.
pub fn next_business_day() -> NaiveDate {
    let mut d = Utc::now().date_naive() + Duration::days(1);
    while matches!(d.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        d += Duration::days(1);
    }
    d
}

/// Truncate a string for log/error contexts without splitting UTF-8.
pub fn truncate_for_log(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

/// Split a display name into (first, rest) the way CRM name fields expect.
pub fn split_name(name: &str) -> (String, String) {
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.as_slice() {
        [] => (String::new(), String::new()),
        [first] => (first.to_string(), String::new()),
        [first, rest @ ..] => (first.to_string(), rest.join(" ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn domain_extraction() {
        assert_eq!(
            domain_of_email("john@Acme.COM").as_deref(),
            Some("acme.com")
        );
        assert_eq!(domain_of_email("not-an-email"), None);
        assert_eq!(domain_of_email("trailing@"), None);
    }

    #[test]
    fn clean_domain_strips_noise() {
        assert_eq!(clean_domain("https://www.Nike.com/"), "nike.com");
        assert_eq!(clean_domain("deputy.com"), "deputy.com");
    }

    #[test]
    fn qa_formatting() {
        let qa = json!([
            {"question": "Team size?", "answer": "2 to 5"},
            {"question": "", "answer": "Trello"},
            {"question": "", "answer": ""},
        ]);
        assert_eq!(qa_to_text(&qa), "1. Team size?: 2 to 5\n2. Trello");
        assert_eq!(qa_to_text(&json!("not a list")), "");
    }

    #[test]
    fn next_business_day_is_a_weekday() {
        let d = next_business_day();
        assert!(!matches!(
            d.weekday(),
            chrono::Weekday::Sat | chrono::Weekday::Sun
        ));
    }

    #[test]
    fn split_name_variants() {
        assert_eq!(split_name("Isabelle Mercier"), ("Isabelle".into(), "Mercier".into()));
        assert_eq!(split_name("Cher"), ("Cher".into(), String::new()));
        assert_eq!(
            split_name("Ana de la Cruz"),
            ("Ana".into(), "de la Cruz".into())
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_for_log(s, 3);
        assert!(t.ends_with("...(truncated)"));
    }
}
