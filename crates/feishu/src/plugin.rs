//! `ChannelPlugin` implementation: account lifecycle, status reporting, and
//! the outbound action surface.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::Serialize,
    serde_json::{Value, json},
    tracing::{info, warn},
};

use perch_channels::{
    ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus,
};

use crate::{
    config::EventMode,
    error::{Error, Result},
    inbound,
    outbound::{FeishuClient, FeishuOutbound},
    runtime::FeishuRuntime,
    ws::EventCallback,
};

/// Status snapshot for one account, merged from config and connection state.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub configured: bool,
    pub running: bool,
    pub connected: bool,
    pub last_start_at: Option<i64>,
    pub last_stop_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
}

/// Message actions the host can invoke against an account.
#[derive(Debug, Clone)]
pub enum OutboundAction {
    SendText {
        to: String,
        text: String,
    },
    SendMedia {
        to: String,
        text: String,
        media_url: String,
    },
    React {
        message_id: String,
        emoji: String,
        remove: bool,
    },
    Edit {
        message_id: String,
        text: String,
    },
    Delete {
        message_id: String,
    },
    Pin {
        message_id: String,
        remove: bool,
    },
    MemberInfo {
        user_id: String,
    },
}

impl OutboundAction {
    /// Config gate key for this action, if it is gateable.
    fn gate_key(&self) -> Option<&'static str> {
        match self {
            Self::SendText { .. } | Self::SendMedia { .. } => None,
            Self::React { .. } => Some("reactions"),
            Self::Edit { .. } | Self::Delete { .. } => Some("messages"),
            Self::Pin { .. } => Some("pins"),
            Self::MemberInfo { .. } => Some("member_info"),
        }
    }
}

/// Feishu channel plugin.
pub struct FeishuPlugin {
    runtime: Arc<FeishuRuntime>,
    outbound: FeishuOutbound,
}

impl FeishuPlugin {
    pub fn new(runtime: Arc<FeishuRuntime>) -> Self {
        let outbound = FeishuOutbound::new(Arc::clone(&runtime));
        Self { runtime, outbound }
    }

    pub fn runtime(&self) -> &Arc<FeishuRuntime> {
        &self.runtime
    }

    /// Start every configured account, isolating failures per account.
    pub async fn start_all(&self) {
        for account_id in self.runtime.account_ids() {
            if let Err(err) = self.start_account(&account_id).await {
                warn!(account_id = %account_id, error = %err, "account start failed");
            }
        }
    }

    /// Callback routing streaming frames through the same gating path as the
    /// webhook. Errors are logged; one bad event never stops the socket.
    fn event_callback(&self, account_id: &str) -> EventCallback {
        let runtime = Arc::clone(&self.runtime);
        let account_id = account_id.to_string();
        Arc::new(move |envelope| {
            let runtime = Arc::clone(&runtime);
            let account_id = account_id.clone();
            Box::pin(async move {
                if let Err(err) =
                    inbound::handle_inbound_event(&runtime, &account_id, envelope).await
                {
                    warn!(
                        account_id = %account_id,
                        error = %err,
                        "inbound event processing failed"
                    );
                }
            })
        })
    }

    /// Build the status snapshot for one account.
    pub fn account_snapshot(&self, account_id: &str) -> AccountSnapshot {
        let account = self.runtime.resolve(Some(account_id));
        let state = self.runtime.registry().state(&account.account_id);
        AccountSnapshot {
            connected: self.runtime.registry().is_connected(&account.account_id),
            configured: account.is_configured(),
            account_id: account.account_id,
            name: account.name,
            enabled: account.enabled,
            running: state.running,
            last_start_at: state.last_start_at,
            last_stop_at: state.last_stop_at,
            last_error: state.last_error,
            last_inbound_at: state.last_inbound_at,
            last_outbound_at: state.last_outbound_at,
        }
    }

    /// Perform a message action with the account's credentials, honoring the
    /// account's action gates.
    pub async fn perform(&self, account_id: &str, action: OutboundAction) -> Result<Value> {
        let account = self.runtime.resolve(Some(account_id));
        if let Some(key) = action.gate_key()
            && !account.action_enabled(key)
        {
            return Err(Error::configuration(format!(
                "action gate {key} is disabled for account {}",
                account.account_id
            )));
        }
        let client = FeishuClient::for_account(&account)?;
        let http = self.runtime.http();

        let result = match action {
            OutboundAction::SendText { to, text } => {
                let receipt = client.send_text(http, &to, &text, None).await?;
                self.runtime.registry().note_outbound(&account.account_id);
                serde_json::to_value(receipt)?
            },
            OutboundAction::SendMedia {
                to,
                text,
                media_url,
            } => {
                let receipt = client
                    .send_media(http, &to, &text, &media_url, None)
                    .await?;
                self.runtime.registry().note_outbound(&account.account_id);
                serde_json::to_value(receipt)?
            },
            OutboundAction::React {
                message_id,
                emoji,
                remove,
            } => client.react(http, &message_id, &emoji, remove).await?,
            OutboundAction::Edit { message_id, text } => {
                serde_json::to_value(client.edit_text(http, &message_id, &text).await?)?
            },
            OutboundAction::Delete { message_id } => {
                client.delete_message(http, &message_id).await?;
                json!({ "ok": true })
            },
            OutboundAction::Pin { message_id, remove } => {
                client.pin_message(http, &message_id, remove).await?;
                json!({ "ok": true })
            },
            OutboundAction::MemberInfo { user_id } => {
                client.member_info(http, &user_id).await?
            },
        };
        Ok(result)
    }
}

#[async_trait]
impl ChannelPlugin for FeishuPlugin {
    fn id(&self) -> &str {
        "feishu"
    }

    fn name(&self) -> &str {
        "Feishu"
    }

    async fn start_account(&self, account_id: &str) -> anyhow::Result<()> {
        let account = self.runtime.resolve(Some(account_id));
        if !account.enabled {
            return Err(Error::configuration(format!(
                "account {} is disabled",
                account.account_id
            ))
            .into());
        }

        match account.event_mode {
            EventMode::Ws => {
                let callback = self.event_callback(&account.account_id);
                Arc::clone(self.runtime.registry())
                    .start_streaming(&account, self.runtime.http(), callback)
                    .await?;
            },
            EventMode::Http => {
                // Webhook-only account: drop any stale socket from a mode
                // change, then mark the account live.
                let registry = self.runtime.registry();
                if registry.has_client(&account.account_id) {
                    registry.stop_streaming(&account.account_id);
                }
                registry.mark_running(&account.account_id);
                info!(account_id = %account.account_id, "webhook account started");
            },
        }
        Ok(())
    }

    async fn stop_account(&self, account_id: &str) -> anyhow::Result<()> {
        let stopped = self.runtime.registry().stop_streaming(account_id);
        info!(account_id, stopped, "account stopped");
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for FeishuPlugin {
    async fn probe(&self, account_id: &str) -> anyhow::Result<ChannelHealthSnapshot> {
        let snapshot = self.account_snapshot(account_id);
        let details = snapshot
            .last_error
            .clone()
            .or_else(|| (!snapshot.configured).then(|| "app_id/app_secret missing".to_string()))
            .or_else(|| (!snapshot.running).then(|| "account not started".to_string()));
        Ok(ChannelHealthSnapshot {
            connected: snapshot.connected,
            account_id: snapshot.account_id,
            details,
        })
    }
}
