use serde::{Deserialize, Serialize};

/// Normalize an allow-list for matching: trim entries, drop empties,
/// lowercase the rest.
pub fn normalize_allow_from(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Check whether a sender is present in an allow-list.
///
/// Entries are matched case-insensitively against the sender ID. A literal
/// `"*"` entry admits every non-empty sender. An empty sender never matches.
pub fn has_allow_entry(allow_from: &[String], sender_id: &str) -> bool {
    if sender_id.is_empty() {
        return false;
    }
    let normalized = normalize_allow_from(allow_from);
    if normalized.iter().any(|entry| entry == "*") {
        return true;
    }
    let sender = sender_id.to_lowercase();
    normalized.iter().any(|entry| *entry == sender)
}

/// Direct-message access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    Open,
    /// Unknown senders are offered a pairing code an operator must approve.
    #[default]
    Pairing,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot responds in all groups.
    #[default]
    Open,
    /// Only in groups with an explicit per-group configuration entry.
    Allowlist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_matches_nothing() {
        assert!(!has_allow_entry(&[], "anyone"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let list = vec!["Alice".into(), "bob".into()];
        assert!(has_allow_entry(&list, "alice"));
        assert!(has_allow_entry(&list, "BOB"));
        assert!(!has_allow_entry(&list, "charlie"));
    }

    #[test]
    fn wildcard_entry_admits_everyone() {
        let list = vec!["*".into()];
        assert!(has_allow_entry(&list, "anyone"));
        assert!(!has_allow_entry(&list, ""));
    }

    #[test]
    fn empty_sender_never_matches() {
        let list = vec!["alice".into()];
        assert!(!has_allow_entry(&list, ""));
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        let entries = vec!["  Alice ".into(), String::new(), "BOB".into(), "  ".into()];
        assert_eq!(normalize_allow_from(&entries), vec!["alice", "bob"]);
    }
}
