//! Subject-key extraction and rule resolution.
//!
//! A subject like `"urgent - Jane Doe"` yields the key `"urgent"`. The key
//! is then resolved against the enabled rules in three tiers:
//! 1. exact match
//! 2. case-insensitive match
//! 3. case-insensitive substring (the rule key contains the extracted key)
//!
//! The first tier with a hit wins; within a tier the lowest rule id wins.

use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::store::{RelayStore, Rule};

/// Extract the routing key from a subject line.
///
/// Total: every input produces a key, possibly empty.
pub fn extract_key(subject: &str) -> String {
    let subject = subject.trim();
    if subject.is_empty() {
        return String::new();
    }

    if let Some((head, tail)) = subject.split_once('-') {
        let head = head.trim();
        if !head.is_empty() && !tail.trim().is_empty() {
            return head.to_string();
        }
    }

    subject
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Which tier produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    CaseInsensitive,
    Substring,
}

/// Pick the rule for `key` from `rules` (assumed ordered by id ascending).
pub fn select_rule<'a>(rules: &'a [Rule], key: &str) -> Option<(&'a Rule, MatchTier)> {
    if key.is_empty() {
        return None;
    }

    let enabled = || rules.iter().filter(|r| r.enabled);

    if let Some(rule) = enabled().find(|r| r.key == key) {
        return Some((rule, MatchTier::Exact));
    }

    let lowered = key.to_lowercase();
    if let Some(rule) = enabled().find(|r| r.key.to_lowercase() == lowered) {
        return Some((rule, MatchTier::CaseInsensitive));
    }

    enabled()
        .find(|r| r.key.to_lowercase().contains(&lowered))
        .map(|rule| (rule, MatchTier::Substring))
}

/// Resolves extracted keys against the rules in the store.
pub struct RuleMatcher {
    store: Arc<dyn RelayStore>,
}

impl RuleMatcher {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Find the rule for `key`. `Ok(None)` is the normal no-match outcome.
    pub async fn resolve(&self, key: &str) -> Result<Option<Rule>, StoreError> {
        if key.is_empty() {
            return Ok(None);
        }

        let rules = self.store.list_enabled_rules().await?;
        let found = select_rule(&rules, key);
        if let Some((rule, tier)) = &found {
            debug!(key, rule_id = rule.id, rule_key = %rule.key, ?tier, "Rule matched");
        }
        Ok(found.map(|(rule, _)| rule.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, NewRule};
    use chrono::Utc;

    fn rule(id: i64, key: &str) -> Rule {
        Rule {
            id,
            key: key.into(),
            target_address: format!("{key}@example.com"),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // ── extract_key ─────────────────────────────────────────────────

    #[test]
    fn key_before_dash() {
        assert_eq!(extract_key("urgent - Jane Doe"), "urgent");
        assert_eq!(extract_key("  billing-invoice 42  "), "billing");
        assert_eq!(extract_key("Project X - status - weekly"), "Project X");
    }

    #[test]
    fn key_is_first_token_without_dash() {
        assert_eq!(extract_key("hello world"), "hello");
        assert_eq!(extract_key("single"), "single");
    }

    #[test]
    fn key_for_degenerate_dash_placement() {
        assert_eq!(extract_key("- leading dash"), "-");
        assert_eq!(extract_key("trailing -"), "trailing");
    }

    #[test]
    fn empty_subject_gives_empty_key() {
        assert_eq!(extract_key(""), "");
        assert_eq!(extract_key("   \t "), "");
    }

    #[test]
    fn extract_key_is_deterministic() {
        for subject in ["a - b", "", "x", "  -  ", "ümlaut - ok"] {
            assert_eq!(extract_key(subject), extract_key(subject));
        }
    }

    // ── select_rule ─────────────────────────────────────────────────

    #[test]
    fn exact_beats_case_insensitive() {
        let rules = vec![rule(1, "Urgent"), rule(2, "urgent")];
        let (r, tier) = select_rule(&rules, "urgent").unwrap();
        assert_eq!(r.id, 2);
        assert_eq!(tier, MatchTier::Exact);
    }

    #[test]
    fn case_insensitive_tier() {
        let rules = vec![rule(1, "URGENT")];
        let (r, tier) = select_rule(&rules, "urgent").unwrap();
        assert_eq!(r.id, 1);
        assert_eq!(tier, MatchTier::CaseInsensitive);
    }

    #[test]
    fn substring_tier_rule_contains_key() {
        let rules = vec![rule(1, "superurgent")];
        let (r, tier) = select_rule(&rules, "urgent").unwrap();
        assert_eq!(r.id, 1);
        assert_eq!(tier, MatchTier::Substring);
    }

    #[test]
    fn substring_is_not_reversed() {
        let rules = vec![rule(1, "super")];
        assert!(select_rule(&rules, "superurgent").is_none());
        assert!(select_rule(&rules, "urgent").is_none());
    }

    #[tokio::test]
    async fn hyphenated_subject_does_not_route_to_inner_word() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .create_rule(&NewRule::new("urgent", "ops@example.com"))
            .await
            .unwrap();
        let matcher = RuleMatcher::new(store);

        let key = extract_key("super-urgent-thing - Jane");
        assert_eq!(key, "super");
        assert!(matcher.resolve(&key).await.unwrap().is_none());
    }

    #[test]
    fn lowest_id_wins_within_tier() {
        let rules = vec![rule(3, "aurgent"), rule(5, "burgent")];
        let (r, _) = select_rule(&rules, "urgent").unwrap();
        assert_eq!(r.id, 3);
    }

    #[test]
    fn disabled_rules_never_match() {
        let mut r = rule(1, "urgent");
        r.enabled = false;
        assert!(select_rule(&[r], "urgent").is_none());
    }

    #[test]
    fn empty_key_matches_nothing() {
        let rules = vec![rule(1, "anything")];
        assert!(select_rule(&rules, "").is_none());
    }

    // ── RuleMatcher ─────────────────────────────────────────────────

    #[tokio::test]
    async fn resolve_against_store() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .create_rule(&NewRule::new("urgent", "ops@example.com"))
            .await
            .unwrap();
        store
            .create_rule(&NewRule::new("billing", "finance@example.com").disabled())
            .await
            .unwrap();

        let matcher = RuleMatcher::new(store);
        let hit = matcher.resolve("URGENT").await.unwrap().unwrap();
        assert_eq!(hit.target_address, "ops@example.com");
        assert!(matcher.resolve("billing").await.unwrap().is_none());
        assert!(matcher.resolve("").await.unwrap().is_none());
        assert!(matcher.resolve("unknown").await.unwrap().is_none());
    }
}
