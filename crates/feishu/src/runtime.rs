//! Shared engine state: configuration snapshot, connection registry, and the
//! external collaborators, constructed once and passed by handle to every
//! component that needs them.

use std::sync::{Arc, RwLock};

use perch_channels::{PairingStore, ReplyPipeline};

use crate::{
    config::{FeishuConfig, ResolvedAccount},
    state::ConnectionRegistry,
};

pub struct FeishuRuntime {
    config: RwLock<FeishuConfig>,
    registry: Arc<ConnectionRegistry>,
    pairing: Arc<dyn PairingStore>,
    pipeline: Arc<dyn ReplyPipeline>,
    http: reqwest::Client,
}

impl FeishuRuntime {
    pub fn new(
        config: FeishuConfig,
        pairing: Arc<dyn PairingStore>,
        pipeline: Arc<dyn ReplyPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            pairing,
            pipeline,
            http: reqwest::Client::new(),
        })
    }

    /// Snapshot of the configuration tree.
    pub fn config(&self) -> FeishuConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration tree. Live connections are not restarted;
    /// accounts pick the new values up on their next event.
    pub fn set_config(&self, config: FeishuConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Accounts are derived per access, never cached.
    pub fn resolve(&self, account_id: Option<&str>) -> ResolvedAccount {
        self.config.read().unwrap().resolve(account_id)
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.config.read().unwrap().account_ids()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pairing(&self) -> &Arc<dyn PairingStore> {
        &self.pairing
    }

    pub fn pipeline(&self) -> &Arc<dyn ReplyPipeline> {
        &self.pipeline
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}
