//! Account configuration tree and resolver.
//!
//! Accounts are not stored entities: every access re-derives a
//! [`ResolvedAccount`] by merging the root-level defaults block with the
//! optional named-account override block. Named fields win field-by-field;
//! the nested `dm` block merges key-by-key; the per-group map replaces
//! wholesale.

use std::collections::HashMap;

use {
    perch_channels::gating::{DmPolicy, GroupPolicy},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Account ID used when none is configured or requested.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// REST base URL when no override is configured.
pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn/open-apis";

/// Inbound event transport for an account.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    /// Signed webhook callbacks.
    Http,
    /// Persistent event WebSocket.
    #[default]
    Ws,
}

/// Whether outbound replies are threaded onto the originating message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyToMode {
    /// Never attach a reply-to ID.
    #[default]
    Off,
    /// Attach only to the first reply for an inbound message.
    First,
    /// Attach to every reply.
    All,
}

/// Direct-message sub-config. Merged key-by-key across root and override.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DmConfig {
    pub enabled: Option<bool>,
    pub policy: Option<DmPolicy>,
    pub allow_from: Option<Vec<String>>,
}

/// Per-group policy override, keyed by chat ID or the wildcard `"*"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GroupOverride {
    pub require_mention: Option<bool>,
    pub ignore_other_mentions: Option<bool>,
}

/// One account block. The root block and every named-account block share
/// this shape; absent fields fall through to the root, then to defaults.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccountBlock {
    pub enabled: Option<bool>,
    /// Bot display name, used to recognize self-mentions in groups.
    pub name: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub verification_token: Option<String>,
    pub encrypt_key: Option<String>,
    pub base_url: Option<String>,
    pub event_mode: Option<EventMode>,
    pub dm: Option<DmConfig>,
    pub group_policy: Option<GroupPolicy>,
    pub require_mention: Option<bool>,
    pub ignore_other_mentions: Option<bool>,
    pub reply_to_mode: Option<ReplyToMode>,
    /// Outbound action toggles (`reactions`, `messages`, `pins`,
    /// `member_info`). Absent keys default to enabled.
    pub actions: Option<HashMap<String, bool>>,
    pub groups: Option<HashMap<String, GroupOverride>>,
}

impl std::fmt::Debug for AccountBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountBlock")
            .field("enabled", &self.enabled)
            .field("name", &self.name)
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field(
                "verification_token",
                &self.verification_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "encrypt_key",
                &self.encrypt_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("event_mode", &self.event_mode)
            .finish_non_exhaustive()
    }
}

/// The channel's configuration tree: a root defaults block plus named
/// account overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeishuConfig {
    #[serde(flatten)]
    pub root: AccountBlock,
    pub accounts: HashMap<String, AccountBlock>,
}

fn normalize_account_id(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_ACCOUNT_ID.to_string(),
    }
}

fn merge_dm(root: Option<&DmConfig>, over: Option<&DmConfig>) -> DmConfig {
    let root = root.cloned().unwrap_or_default();
    let over = over.cloned().unwrap_or_default();
    DmConfig {
        enabled: over.enabled.or(root.enabled),
        policy: over.policy.or(root.policy),
        allow_from: over.allow_from.or(root.allow_from),
    }
}

fn merge_blocks(root: &AccountBlock, over: &AccountBlock) -> AccountBlock {
    AccountBlock {
        enabled: over.enabled.or(root.enabled),
        name: over.name.clone().or_else(|| root.name.clone()),
        app_id: over.app_id.clone().or_else(|| root.app_id.clone()),
        app_secret: over.app_secret.clone().or_else(|| root.app_secret.clone()),
        verification_token: over
            .verification_token
            .clone()
            .or_else(|| root.verification_token.clone()),
        encrypt_key: over
            .encrypt_key
            .clone()
            .or_else(|| root.encrypt_key.clone()),
        base_url: over.base_url.clone().or_else(|| root.base_url.clone()),
        event_mode: over.event_mode.or(root.event_mode),
        dm: Some(merge_dm(root.dm.as_ref(), over.dm.as_ref())),
        group_policy: over.group_policy.or(root.group_policy),
        require_mention: over.require_mention.or(root.require_mention),
        ignore_other_mentions: over.ignore_other_mentions.or(root.ignore_other_mentions),
        reply_to_mode: over.reply_to_mode.or(root.reply_to_mode),
        actions: over.actions.clone().or_else(|| root.actions.clone()),
        groups: over.groups.clone().or_else(|| root.groups.clone()),
    }
}

impl FeishuConfig {
    /// List configured account IDs. The system always behaves as if at least
    /// one account exists: with no named accounts this is `["default"]`.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .accounts
            .keys()
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .collect();
        if ids.is_empty() {
            return vec![DEFAULT_ACCOUNT_ID.to_string()];
        }
        ids.sort();
        ids
    }

    /// Derive the merged view of one account. Pure: no I/O, no failure —
    /// absent fields resolve to defaults.
    pub fn resolve(&self, account_id: Option<&str>) -> ResolvedAccount {
        let account_id = normalize_account_id(account_id);
        let over = self.accounts.get(&account_id).cloned().unwrap_or_default();
        let merged = merge_blocks(&self.root, &over);
        let dm = merged.dm.unwrap_or_default();

        ResolvedAccount {
            account_id,
            enabled: merged.enabled.unwrap_or(true),
            name: merged.name,
            app_id: merged.app_id,
            app_secret: merged.app_secret.map(Secret::new),
            verification_token: merged.verification_token,
            encrypt_key: merged.encrypt_key.map(Secret::new),
            base_url: merged.base_url,
            event_mode: merged.event_mode.unwrap_or_default(),
            dm_enabled: dm.enabled.unwrap_or(true),
            dm_policy: dm.policy.unwrap_or_default(),
            allow_from: dm.allow_from.unwrap_or_default(),
            group_policy: merged.group_policy.unwrap_or_default(),
            require_mention: merged.require_mention,
            ignore_other_mentions: merged.ignore_other_mentions,
            reply_to_mode: merged.reply_to_mode.unwrap_or_default(),
            actions: merged.actions.unwrap_or_default(),
            groups: merged.groups.unwrap_or_default(),
        }
    }

    /// Flip the enabled flag for an account in the tree.
    pub fn set_account_enabled(&mut self, account_id: &str, enabled: bool) {
        if account_id == DEFAULT_ACCOUNT_ID {
            self.root.enabled = Some(enabled);
        } else {
            self.accounts
                .entry(account_id.to_string())
                .or_default()
                .enabled = Some(enabled);
        }
    }

    /// Remove an account from the tree. For the default account this clears
    /// the root credentials instead.
    pub fn delete_account(&mut self, account_id: &str) {
        if account_id == DEFAULT_ACCOUNT_ID {
            self.root.app_id = None;
            self.root.app_secret = None;
            self.root.verification_token = None;
            self.root.encrypt_key = None;
        } else {
            self.accounts.remove(account_id);
        }
    }
}

/// Fully merged account view. Recomputed per access, never stored.
#[derive(Clone)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub enabled: bool,
    pub name: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<Secret<String>>,
    pub verification_token: Option<String>,
    pub encrypt_key: Option<Secret<String>>,
    pub base_url: Option<String>,
    pub event_mode: EventMode,
    pub dm_enabled: bool,
    pub dm_policy: DmPolicy,
    pub allow_from: Vec<String>,
    pub group_policy: GroupPolicy,
    pub require_mention: Option<bool>,
    pub ignore_other_mentions: Option<bool>,
    pub reply_to_mode: ReplyToMode,
    pub actions: HashMap<String, bool>,
    pub groups: HashMap<String, GroupOverride>,
}

impl ResolvedAccount {
    /// An account is usable for outbound calls (and streaming ingestion)
    /// only when both app ID and app secret are present.
    pub fn is_configured(&self) -> bool {
        self.app_id.as_deref().is_some_and(|id| !id.is_empty())
            && self
                .app_secret
                .as_ref()
                .is_some_and(|secret| !secret.expose_secret().is_empty())
    }

    /// REST base URL for this account.
    pub fn rest_base_url(&self) -> &str {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url,
            _ => DEFAULT_BASE_URL,
        }
    }

    /// Per-group override, looked up by exact chat ID then wildcard `"*"`.
    fn group_override(&self, chat_id: &str) -> Option<&GroupOverride> {
        self.groups.get(chat_id).or_else(|| self.groups.get("*"))
    }

    /// Whether the account has an explicit entry for this exact chat ID.
    /// The group allow-list check does not honor the wildcard.
    pub fn has_group_entry(&self, chat_id: &str) -> bool {
        self.groups.contains_key(chat_id)
    }

    /// Resolve require-mention: group override, then account flag, then false.
    pub fn require_mention_for(&self, chat_id: &str) -> bool {
        self.group_override(chat_id)
            .and_then(|g| g.require_mention)
            .or(self.require_mention)
            .unwrap_or(false)
    }

    /// Resolve ignore-other-mentions: group override, then account flag,
    /// then true (do not interrupt a conversation aimed at someone else).
    pub fn ignore_other_mentions_for(&self, chat_id: &str) -> bool {
        self.group_override(chat_id)
            .and_then(|g| g.ignore_other_mentions)
            .or(self.ignore_other_mentions)
            .unwrap_or(true)
    }

    /// Whether an outbound action is enabled. Unknown keys default to true.
    pub fn action_enabled(&self, key: &str) -> bool {
        self.actions.get(key).copied().unwrap_or(true)
    }
}

impl std::fmt::Debug for ResolvedAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAccount")
            .field("account_id", &self.account_id)
            .field("enabled", &self.enabled)
            .field("name", &self.name)
            .field("app_id", &self.app_id)
            .field("event_mode", &self.event_mode)
            .field("dm_policy", &self.dm_policy)
            .field("group_policy", &self.group_policy)
            .field("reply_to_mode", &self.reply_to_mode)
            .finish_non_exhaustive()
    }
}
