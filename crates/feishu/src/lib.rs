//! Feishu (Lark) channel plugin for perch.
//!
//! Implements `ChannelPlugin` for Feishu's open platform: inbound events over
//! a signed HTTP webhook or the persistent event WebSocket, multi-layered
//! admission gating, and hand-off to the reply pipeline.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod http;
pub mod inbound;
pub mod outbound;
pub mod plugin;
pub mod runtime;
pub mod state;
pub mod ws;

/// Channel identifier used in routes, session keys, and pairing records.
pub const FEISHU_CHANNEL_ID: &str = "feishu";

pub use {
    config::{FeishuConfig, ResolvedAccount},
    error::{Error, Result},
    plugin::FeishuPlugin,
    runtime::FeishuRuntime,
};
