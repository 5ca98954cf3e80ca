use {anyhow::Result, async_trait::async_trait};

use crate::reply::ReplyPayload;

/// Core channel plugin trait. Each messaging platform implements this.
///
/// Plugins take `&self`: account state lives behind interior mutability so
/// lifecycle calls for different accounts can run concurrently.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "feishu").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start an account's inbound transport.
    async fn start_account(&self, account_id: &str) -> Result<()>;

    /// Stop an account's inbound transport.
    async fn stop_account(&self, account_id: &str) -> Result<()>;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Result of a single outbound call, returned to the caller unchanged.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SendReceipt {
    /// Platform-assigned ID of the created message, when the platform
    /// reports one.
    pub message_id: Option<String>,
}

/// Send messages to a channel. Each call is independent, not transactional.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<SendReceipt>;
    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<SendReceipt>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}
