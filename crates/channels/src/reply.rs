//! Reply pipeline contract.
//!
//! A channel hands an admitted inbound message to the reply pipeline as an
//! [`InboundContext`] together with a bounded delivery sender. The pipeline
//! produces zero or more [`ReplyPayload`]s through the sender; dropping the
//! sender and resolving the `dispatch` future is the completion signal. The
//! channel owns the receiving side and performs the actual outbound calls.

use {async_trait::async_trait, serde::Serialize, tokio::sync::mpsc};

use crate::error::Result;

/// Kind of conversation an inbound message arrived in.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

/// One outbound reply produced by the pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplyPayload {
    pub text: Option<String>,
    pub media_url: Option<String>,
}

/// Normalized inbound message context consumed by the reply pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct InboundContext {
    /// Channel identifier (e.g. "feishu").
    pub channel: String,
    pub account_id: String,
    pub chat_type: ChatType,
    /// Stable sender identifier.
    pub sender_id: String,
    pub sender_name: Option<String>,
    /// Composed delivery address (`user:<id>` or `chat:<id>`).
    pub reply_target: String,
    /// Display body, with non-text kinds rendered to a tagged fallback.
    pub body: String,
    /// Body before fallback rendering.
    pub raw_body: String,
    pub message_id: String,
    pub was_mentioned: bool,
    /// Event creation time, epoch milliseconds.
    pub timestamp_ms: Option<i64>,
    pub session_key: String,
}

/// Sending half of the bounded delivery channel handed to the pipeline.
pub type ReplySender = mpsc::Sender<ReplyPayload>;

/// Downstream reply pipeline. External collaborator: routing, session
/// recording, and reply generation all live behind this trait.
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    /// Resolve the session key for a conversation. The default groups
    /// sessions per channel, account, and peer.
    fn session_key(&self, channel: &str, account_id: &str, peer_id: &str) -> String {
        format!("{channel}:{account_id}:{peer_id}")
    }

    /// Process one inbound context, delivering replies through `replies`.
    ///
    /// May deliver zero, one, or many payloads. Implementations must not hold
    /// the sender beyond their own completion.
    async fn dispatch(&self, ctx: InboundContext, replies: ReplySender) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoPipeline;

    #[async_trait]
    impl ReplyPipeline for EchoPipeline {
        async fn dispatch(&self, ctx: InboundContext, replies: ReplySender) -> Result<()> {
            let _ = replies
                .send(ReplyPayload {
                    text: Some(ctx.body),
                    media_url: None,
                })
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn channel_closes_after_dispatch_resolves() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = InboundContext {
            channel: "feishu".into(),
            account_id: "default".into(),
            chat_type: ChatType::Direct,
            sender_id: "u1".into(),
            sender_name: None,
            reply_target: "user:u1".into(),
            body: "hello".into(),
            raw_body: "hello".into(),
            message_id: "m1".into(),
            was_mentioned: false,
            timestamp_ms: None,
            session_key: "feishu:default:u1".into(),
        };
        EchoPipeline.dispatch(ctx, tx).await.expect("dispatch");

        let first = rx.recv().await.expect("one reply");
        assert_eq!(first.text.as_deref(), Some("hello"));
        // Sender dropped with the pipeline — the stream must end.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn default_session_key_shape() {
        let key = EchoPipeline.session_key("feishu", "work", "ou_123");
        assert_eq!(key, "feishu:work:ou_123");
    }
}
