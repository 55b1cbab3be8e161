//! Provisional priority for messages that miss the immediate path.

use crate::protocol::Priority;

/// Keyword heuristic used when a message has to be queued before a worker
/// has classified it.
///
/// Any keyword found in the content (case-insensitive) makes it critical; a
/// sender whose recorded status is `blocked` gets high; everything else is
/// medium.
pub fn fallback_priority(content: &str, sender_status: Option<&str>, keywords: &[String]) -> Priority {
    let content = content.to_lowercase();
    if keywords
        .iter()
        .any(|k| !k.is_empty() && content.contains(&k.to_lowercase()))
    {
        return Priority::Critical;
    }

    if sender_status.is_some_and(|s| s.eq_ignore_ascii_case("blocked")) {
        return Priority::High;
    }

    Priority::Medium
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_urgency_keywords;

    #[test]
    fn test_keyword_is_critical() {
        let keywords = default_urgency_keywords();
        assert_eq!(
            fallback_priority("the build is broken, please help", None, &keywords).weight(),
            1
        );
        assert_eq!(
            fallback_priority("URGENT: prod down", Some("active"), &keywords),
            Priority::Critical
        );
    }

    #[test]
    fn test_blocked_sender_is_high() {
        let keywords = default_urgency_keywords();
        assert_eq!(
            fallback_priority("any news?", Some("blocked"), &keywords),
            Priority::High
        );
    }

    #[test]
    fn test_default_is_medium() {
        let keywords = default_urgency_keywords();
        assert_eq!(
            fallback_priority("good morning", Some("active"), &keywords),
            Priority::Medium
        );
        assert_eq!(fallback_priority("help", None, &[]), Priority::Medium);
    }
}
