//! Channel plugin system.
//!
//! Each messaging platform implements the `ChannelPlugin` trait plus the
//! collaborator traits for pairing storage and reply dispatch. The concrete
//! channels (Feishu today) live in sibling crates.

pub mod error;
pub mod gating;
pub mod pairing;
pub mod plugin;
pub mod reply;

pub use {
    error::{Error, Result},
    gating::{DmPolicy, GroupPolicy, has_allow_entry, normalize_allow_from},
    pairing::{MemoryPairingStore, PairingStore},
    plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus, SendReceipt},
    reply::{ChatType, InboundContext, ReplyPayload, ReplyPipeline, ReplySender},
};
