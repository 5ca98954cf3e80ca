//! Inbound gating engine.
//!
//! Strictly ordered admission pipeline: structural validation, duplicate
//! suppression, classification, sender extraction, mention analysis, then
//! group or direct-message policy. Gating itself is pure; the pairing flow is
//! the only rejection side effect, and a rejected event is never dispatched.

use std::{fmt, sync::Arc};

use {
    serde::Deserialize,
    serde_json::Value,
    tracing::{debug, info},
};

use perch_channels::{
    ChatType,
    gating::{DmPolicy, GroupPolicy, has_allow_entry, normalize_allow_from},
};

use crate::{
    FEISHU_CHANNEL_ID,
    config::ResolvedAccount,
    dispatch,
    error::Result,
    outbound::FeishuClient,
    runtime::FeishuRuntime,
};

/// One mention entry on an inbound message.
#[derive(Debug, Clone, Default)]
pub struct Mention {
    pub name: Option<String>,
    pub key: Option<String>,
    pub user_id: Option<String>,
}

/// The fields this engine needs from an event envelope. Everything else in
/// the payload is dropped at the decode boundary.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    pub message_kind: String,
    pub content: String,
    /// Stable user ID, falling back to the opaque open ID.
    pub sender_id: String,
    /// The platform user ID when present, used as the display sender name.
    pub sender_user_id: Option<String>,
    pub mentions: Vec<Mention>,
    pub created_at_ms: Option<i64>,
}

/// Why an event was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    GroupNotOnAllowlist,
    NotMentioned,
    /// Somebody else was mentioned and the polite default applies.
    OtherConversation,
    DmsDisabled,
    SenderNotAllowed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupNotOnAllowlist => write!(f, "group not on allowlist"),
            Self::NotMentioned => write!(f, "bot was not mentioned"),
            Self::OtherConversation => write!(f, "message aimed at someone else"),
            Self::DmsDisabled => write!(f, "DMs are disabled"),
            Self::SenderNotAllowed => write!(f, "sender not on allowlist"),
        }
    }
}

/// Admission decision for a direct message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Gate {
    Admit,
    /// Rejected, but the pairing flow should be offered to the sender.
    PairingRequired,
    Reject(DropReason),
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Extract the fields this engine needs from a loose envelope. Fails closed:
/// an event without a message ID and chat ID cannot be attributed to a
/// conversation and yields `None`.
pub(crate) fn decode_event(envelope: &Value) -> Option<InboundMessage> {
    let payload = match envelope.get("event") {
        Some(event) if event.is_object() => event,
        _ => envelope,
    };
    let message = payload.get("message")?;
    let message_id = non_empty_str(message.get("message_id"))?.to_string();
    let chat_id = non_empty_str(message.get("chat_id"))?.to_string();

    let chat_type = match message.get("chat_type").and_then(Value::as_str) {
        Some("p2p") => ChatType::Direct,
        _ => ChatType::Group,
    };
    let message_kind = message
        .get("message_type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_string();
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mentions = message
        .get("mentions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| Mention {
                    name: entry.get("name").and_then(Value::as_str).map(String::from),
                    key: entry.get("key").and_then(Value::as_str).map(String::from),
                    user_id: entry
                        .pointer("/id/user_id")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
                .collect()
        })
        .unwrap_or_default();

    let sender_user_id = non_empty_str(payload.pointer("/sender/sender_id/user_id")).map(String::from);
    let sender_open_id = non_empty_str(payload.pointer("/sender/sender_id/open_id")).map(String::from);
    let sender_id = sender_user_id
        .clone()
        .or(sender_open_id)
        .unwrap_or_default();

    let created_at_ms = match envelope.pointer("/header/create_time") {
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    };

    Some(InboundMessage {
        message_id,
        chat_id,
        chat_type,
        message_kind,
        content,
        sender_id,
        sender_user_id,
        mentions,
        created_at_ms,
    })
}

/// Mention flags for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MentionFlags {
    pub has_any: bool,
    pub was_mentioned: bool,
}

fn is_all_mention(mention: &Mention) -> bool {
    mention.key.as_deref() == Some("all")
        || matches!(mention.name.as_deref(), Some("all") | Some("所有人"))
}

/// Start from "any mention counts", then narrow with the account's display
/// name when one is configured: only a mention containing the name (case-
/// insensitively) or an all-participants mention counts as self.
pub(crate) fn analyze_mentions(
    mentions: &[Mention],
    account_name: Option<&str>,
) -> MentionFlags {
    let has_any = !mentions.is_empty();
    let mut was_mentioned = has_any;

    let name = account_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_lowercase);
    if was_mentioned && let Some(name) = name {
        let self_mentioned = mentions.iter().any(|mention| {
            mention
                .name
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(&name))
        });
        let all_mentioned = mentions.iter().any(is_all_mention);
        was_mentioned = self_mentioned || all_mentioned;
    }

    MentionFlags {
        has_any,
        was_mentioned,
    }
}

/// Group admission.
pub(crate) fn gate_group(
    account: &ResolvedAccount,
    chat_id: &str,
    flags: MentionFlags,
) -> std::result::Result<(), DropReason> {
    if account.group_policy == GroupPolicy::Allowlist && !account.has_group_entry(chat_id) {
        return Err(DropReason::GroupNotOnAllowlist);
    }
    if account.require_mention_for(chat_id) {
        if !flags.was_mentioned {
            return Err(DropReason::NotMentioned);
        }
    } else if account.ignore_other_mentions_for(chat_id) && flags.has_any && !flags.was_mentioned {
        return Err(DropReason::OtherConversation);
    }
    Ok(())
}

/// Direct-message admission against the combined config + store allow-list.
pub(crate) fn gate_dm(
    account: &ResolvedAccount,
    allow_from: &[String],
    sender_id: &str,
) -> Gate {
    if !account.dm_enabled {
        return Gate::Reject(DropReason::DmsDisabled);
    }
    let allowed = if allow_from.is_empty() {
        account.dm_policy == DmPolicy::Open
    } else {
        has_allow_entry(allow_from, sender_id)
    };
    if allowed {
        Gate::Admit
    } else if account.dm_policy == DmPolicy::Pairing {
        Gate::PairingRequired
    } else {
        Gate::Reject(DropReason::SenderNotAllowed)
    }
}

/// Unwrap a structured text content envelope defensively: JSON `{"text": …}`
/// yields its text field, anything else is used verbatim.
pub(crate) fn parse_text_content(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    #[derive(Deserialize)]
    struct TextContent {
        text: Option<String>,
    }
    match serde_json::from_str::<TextContent>(raw) {
        Ok(content) => content.text.unwrap_or_default(),
        Err(_) => raw.to_string(),
    }
}

/// Offer the pairing flow to an unauthorized DM sender. The event itself is
/// still dropped; only the code reply goes out.
async fn run_pairing(
    rt: &Arc<FeishuRuntime>,
    account: &ResolvedAccount,
    sender_id: &str,
    reply_target: &str,
) -> Result<()> {
    let Some(code) = rt
        .pairing()
        .upsert_pairing_request(FEISHU_CHANNEL_ID, sender_id)
        .await?
    else {
        return Ok(());
    };
    let reply = rt.pairing().build_pairing_reply(
        FEISHU_CHANNEL_ID,
        &format!("Feishu user: {sender_id}"),
        &code,
    );
    let client = FeishuClient::for_account(account)?;
    client.send_text(rt.http(), reply_target, &reply, None).await?;
    rt.registry().note_outbound(&account.account_id);
    Ok(())
}

/// Process one inbound event envelope for an account: gate it and, when
/// admitted, hand it to the dispatch adapter. A failure here affects only
/// this event.
pub async fn handle_inbound_event(
    rt: &Arc<FeishuRuntime>,
    account_id: &str,
    envelope: Value,
) -> Result<()> {
    let account = rt.resolve(Some(account_id));

    let Some(message) = decode_event(&envelope) else {
        let event_type = envelope
            .pointer("/header/event_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(
            account_id = %account.account_id,
            event_type,
            "inbound ignored: missing message_id/chat_id"
        );
        return Ok(());
    };
    info!(
        account_id = %account.account_id,
        message_id = %message.message_id,
        chat_id = %message.chat_id,
        kind = %message.message_kind,
        "inbound message received"
    );

    if !rt
        .registry()
        .first_seen(&account.account_id, &message.message_id)
    {
        debug!(
            account_id = %account.account_id,
            message_id = %message.message_id,
            "inbound ignored: duplicate delivery"
        );
        return Ok(());
    }

    if message.sender_id.is_empty() {
        debug!(account_id = %account.account_id, "inbound ignored: no sender");
        return Ok(());
    }

    let flags = analyze_mentions(&message.mentions, account.name.as_deref());
    let reply_target = match message.chat_type {
        ChatType::Direct => format!("user:{}", message.sender_id),
        ChatType::Group => format!("chat:{}", message.chat_id),
    };

    match message.chat_type {
        ChatType::Group => {
            if let Err(reason) = gate_group(&account, &message.chat_id, flags) {
                debug!(
                    account_id = %account.account_id,
                    chat_id = %message.chat_id,
                    %reason,
                    "group message rejected"
                );
                return Ok(());
            }
        },
        ChatType::Direct => {
            let mut allow_from = normalize_allow_from(&account.allow_from);
            let stored = rt
                .pairing()
                .read_allow_from_store(FEISHU_CHANNEL_ID)
                .await?;
            allow_from.extend(normalize_allow_from(&stored));

            match gate_dm(&account, &allow_from, &message.sender_id) {
                Gate::Admit => {},
                Gate::PairingRequired => {
                    info!(
                        account_id = %account.account_id,
                        sender_id = %message.sender_id,
                        "dm sender not authorized, offering pairing"
                    );
                    run_pairing(rt, &account, &message.sender_id, &reply_target).await?;
                    return Ok(());
                },
                Gate::Reject(reason) => {
                    debug!(
                        account_id = %account.account_id,
                        sender_id = %message.sender_id,
                        %reason,
                        "dm rejected"
                    );
                    return Ok(());
                },
            }
        },
    }

    dispatch::dispatch_admitted(rt, &account, message, flags.was_mentioned, reply_target).await
}
