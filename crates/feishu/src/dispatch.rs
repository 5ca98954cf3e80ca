//! Dispatch adapter: admitted event → reply pipeline invocation.
//!
//! Builds the pipeline context, consumes delivered replies from the bounded
//! channel, applies the reply-threading mode, and keeps the connection-state
//! bookkeeping honest: the inbound stamp lands exactly once per event no
//! matter how many replies come back.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {tokio::sync::mpsc, tracing::warn};

use perch_channels::{ChatType, InboundContext, ReplyPayload};

use crate::{
    FEISHU_CHANNEL_ID,
    config::{ReplyToMode, ResolvedAccount},
    error::{Error, Result},
    inbound::{InboundMessage, parse_text_content},
    outbound::FeishuClient,
    runtime::FeishuRuntime,
};

/// Depth of the reply delivery channel.
const REPLY_QUEUE_DEPTH: usize = 16;

/// Pick the reply-to ID for one outbound payload.
fn resolve_reply_to<'a>(
    mode: ReplyToMode,
    message_id: &'a str,
    has_replied: bool,
) -> Option<&'a str> {
    match mode {
        ReplyToMode::Off => None,
        ReplyToMode::All => Some(message_id),
        ReplyToMode::First => (!has_replied).then_some(message_id),
    }
}

/// Render the pipeline body: text content is unwrapped, other kinds get a
/// bracketed type tag plus best-effort text.
fn render_body(message: &InboundMessage) -> (String, String) {
    let text_body = if message.message_kind == "text" {
        parse_text_content(&message.content)
    } else {
        String::new()
    };
    let body = if text_body.is_empty() {
        format!(
            "[Feishu {}] {}",
            message.message_kind,
            parse_text_content(&message.content)
        )
    } else {
        text_body.clone()
    };
    let raw_body = if text_body.is_empty() {
        body.clone()
    } else {
        text_body
    };
    (body, raw_body)
}

pub(crate) async fn dispatch_admitted(
    rt: &Arc<FeishuRuntime>,
    account: &ResolvedAccount,
    message: InboundMessage,
    was_mentioned: bool,
    reply_target: String,
) -> Result<()> {
    let (body, raw_body) = render_body(&message);
    let peer_id = match message.chat_type {
        ChatType::Direct => message.sender_id.as_str(),
        ChatType::Group => message.chat_id.as_str(),
    };
    let session_key = rt
        .pipeline()
        .session_key(FEISHU_CHANNEL_ID, &account.account_id, peer_id);

    let ctx = InboundContext {
        channel: FEISHU_CHANNEL_ID.to_string(),
        account_id: account.account_id.clone(),
        chat_type: message.chat_type,
        sender_id: message.sender_id.clone(),
        sender_name: message.sender_user_id.clone(),
        reply_target: reply_target.clone(),
        body,
        raw_body,
        message_id: message.message_id.clone(),
        was_mentioned,
        timestamp_ms: message.created_at_ms,
        session_key,
    };

    let client = FeishuClient::for_account(account)?;
    let reply_to_mode = account.reply_to_mode;
    let has_replied = AtomicBool::new(false);
    let (tx, mut rx) = mpsc::channel::<ReplyPayload>(REPLY_QUEUE_DEPTH);

    let deliver = async {
        while let Some(payload) = rx.recv().await {
            let reply_to_id = resolve_reply_to(
                reply_to_mode,
                &message.message_id,
                has_replied.load(Ordering::SeqCst),
            );
            let sent = if let Some(media_url) = payload.media_url.as_deref() {
                client
                    .send_media(
                        rt.http(),
                        &reply_target,
                        payload.text.as_deref().unwrap_or_default(),
                        media_url,
                        reply_to_id,
                    )
                    .await
                    .map(|_| true)
            } else if let Some(text) = payload.text.as_deref().filter(|text| !text.is_empty()) {
                client
                    .send_text(rt.http(), &reply_target, text, reply_to_id)
                    .await
                    .map(|_| true)
            } else {
                Ok(false)
            };
            match sent {
                Ok(true) => {
                    has_replied.store(true, Ordering::SeqCst);
                    rt.registry().note_outbound(&account.account_id);
                },
                Ok(false) => {},
                Err(err) => {
                    warn!(
                        account_id = %account.account_id,
                        error = %err,
                        "reply delivery failed"
                    );
                },
            }
        }
    };

    let dispatched = rt.pipeline().dispatch(ctx, tx);
    let (result, ()) = tokio::join!(dispatched, deliver);

    // The inbound stamp is recorded once per event, replies or not.
    rt.registry().note_inbound(&account.account_id);

    result.map_err(|err| Error::downstream(err.to_string()))
}

#[cfg(test)]
mod tests {
    use perch_channels::ChatType;

    use super::*;
    use crate::inbound::InboundMessage;

    #[test]
    fn reply_to_follows_mode() {
        assert_eq!(resolve_reply_to(ReplyToMode::Off, "om_1", false), None);
        assert_eq!(resolve_reply_to(ReplyToMode::Off, "om_1", true), None);
        assert_eq!(
            resolve_reply_to(ReplyToMode::All, "om_1", true),
            Some("om_1")
        );
        assert_eq!(
            resolve_reply_to(ReplyToMode::First, "om_1", false),
            Some("om_1")
        );
        assert_eq!(resolve_reply_to(ReplyToMode::First, "om_1", true), None);
    }

    fn message(kind: &str, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: "om_1".into(),
            chat_id: "oc_1".into(),
            chat_type: ChatType::Direct,
            message_kind: kind.into(),
            content: content.into(),
            sender_id: "u_1".into(),
            sender_user_id: None,
            mentions: Vec::new(),
            created_at_ms: None,
        }
    }

    #[test]
    fn text_body_is_unwrapped() {
        let (body, raw_body) = render_body(&message("text", r#"{"text":"hi there"}"#));
        assert_eq!(body, "hi there");
        assert_eq!(raw_body, "hi there");
    }

    #[test]
    fn non_text_kinds_get_a_type_tag() {
        let (body, _) = render_body(&message("sticker", r#"{"file_key":"fk"}"#));
        assert_eq!(body, "[Feishu sticker] ");

        let (with_text, _) = render_body(&message("post", r#"{"text":"rich body"}"#));
        assert_eq!(with_text, "[Feishu post] rich body");
    }

    #[test]
    fn empty_text_message_falls_back_to_tag() {
        let (body, raw_body) = render_body(&message("text", r#"{"other":true}"#));
        assert_eq!(body, "[Feishu text] ");
        assert_eq!(raw_body, body);
    }
}
