//! Process-wide connection registry.
//!
//! One explicit, injectable store keyed by account ID: runtime state (running
//! flag, timestamps, last error), live event-socket handles, and the bounded
//! recent-message cache. Locks are `std::sync` and never held across `.await`
//! points.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, RwLock},
};

use {serde::Serialize, tracing::{error, info}};

use crate::{
    config::{EventMode, ResolvedAccount},
    error::{Error, Result},
    ws::{EventCallback, FatalHook, FeishuWsClient},
};

/// Recent message IDs remembered per account for duplicate suppression.
const DEDUP_CAPACITY: usize = 256;

/// Current epoch time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Per-account connection state. Created lazily, never destroyed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeState {
    pub running: bool,
    pub last_start_at: Option<i64>,
    pub last_stop_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
}

#[derive(Default)]
struct SeenMessages {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenMessages {
    /// Record a message ID. Returns false when it was already present.
    fn insert(&mut self, message_id: &str) -> bool {
        if self.set.contains(message_id) {
            return false;
        }
        if self.order.len() >= DEDUP_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.set.remove(&oldest);
        }
        self.order.push_back(message_id.to_string());
        self.set.insert(message_id.to_string());
        true
    }
}

/// Registry of per-account connection state and socket handles.
#[derive(Default)]
pub struct ConnectionRegistry {
    states: RwLock<HashMap<String, RuntimeState>>,
    clients: RwLock<HashMap<String, FeishuWsClient>>,
    seen: RwLock<HashMap<String, SeenMessages>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an account's connection state, created lazily with
    /// all-false/None defaults.
    pub fn state(&self, account_id: &str) -> RuntimeState {
        let mut states = self.states.write().unwrap();
        states.entry(account_id.to_string()).or_default().clone()
    }

    fn update_state(&self, account_id: &str, update: impl FnOnce(&mut RuntimeState)) {
        let mut states = self.states.write().unwrap();
        update(states.entry(account_id.to_string()).or_default());
    }

    /// Record inbound activity for an account.
    pub fn note_inbound(&self, account_id: &str) {
        self.update_state(account_id, |state| state.last_inbound_at = Some(now_ms()));
    }

    /// Record outbound activity for an account.
    pub fn note_outbound(&self, account_id: &str) {
        self.update_state(account_id, |state| state.last_outbound_at = Some(now_ms()));
    }

    /// Mark an account running without a socket (webhook-only transport).
    pub fn mark_running(&self, account_id: &str) {
        self.update_state(account_id, |state| {
            state.running = true;
            state.last_start_at = Some(now_ms());
            state.last_error = None;
        });
    }

    /// Whether an event-socket handle exists for the account (starting or
    /// running).
    pub fn has_client(&self, account_id: &str) -> bool {
        self.clients.read().unwrap().contains_key(account_id)
    }

    /// Non-blocking connectivity flag for status reporting.
    pub fn is_connected(&self, account_id: &str) -> bool {
        self.clients
            .read()
            .unwrap()
            .get(account_id)
            .is_some_and(FeishuWsClient::is_connected)
    }

    /// First-delivery check for a message ID, bounded per account. Returns
    /// false for a duplicate.
    pub fn first_seen(&self, account_id: &str, message_id: &str) -> bool {
        let mut seen = self.seen.write().unwrap();
        seen.entry(account_id.to_string())
            .or_default()
            .insert(message_id)
    }

    /// Start the event socket for an account.
    ///
    /// Idempotent: returns `Ok(false)` when a handle already exists. Fails
    /// fast with a configuration error — without touching registry state —
    /// when the account is not in streaming mode, is disabled, or has no
    /// credentials. The handle is registered before the endpoint handshake
    /// so a concurrent start observes it and no-ops.
    pub async fn start_streaming(
        self: Arc<Self>,
        account: &ResolvedAccount,
        http: &reqwest::Client,
        on_event: EventCallback,
    ) -> Result<bool> {
        let account_id = account.account_id.clone();
        if account.event_mode != EventMode::Ws {
            return Err(Error::configuration(format!(
                "account {account_id} is not in streaming mode"
            )));
        }
        if !account.enabled {
            return Err(Error::configuration(format!(
                "account {account_id} is disabled"
            )));
        }
        if !account.is_configured() {
            return Err(Error::configuration(format!(
                "account {account_id} has no app_id/app_secret"
            )));
        }
        let app_id = account.app_id.clone().unwrap_or_default();
        let app_secret = account
            .app_secret
            .clone()
            .unwrap_or_else(|| secrecy::Secret::new(String::new()));

        let client = FeishuWsClient::new(app_id, app_secret, account.rest_base_url().to_string());
        {
            let mut clients = self.clients.write().unwrap();
            if clients.contains_key(&account_id) {
                return Ok(false);
            }
            clients.insert(account_id.clone(), client.clone());
        }

        info!(account_id = %account_id, "starting event socket");
        let endpoint = match client.fetch_endpoint(http).await {
            Ok(url) => url,
            Err(err) => {
                // Only roll back if this start is still the registered one;
                // a stop/restart may have raced the handshake.
                if self.remove_exact(&account_id, &client) {
                    self.update_state(&account_id, |state| {
                        state.running = false;
                        state.last_error = Some(err.to_string());
                    });
                }
                error!(account_id = %account_id, error = %err, "event socket handshake failed");
                return Err(err);
            },
        };

        if client.is_cancelled() {
            // A stop raced the pending start; the account stays stopped.
            self.remove_exact(&account_id, &client);
            return Ok(false);
        }

        let registry = Arc::downgrade(&self);
        let fatal_account = account_id.clone();
        let fatal_client = client.clone();
        let on_fatal: FatalHook = Box::new(move |message| {
            if let Some(registry) = registry.upgrade() {
                registry.record_fatal(&fatal_account, &fatal_client, &message);
            }
        });
        client.spawn(http.clone(), endpoint, on_event, on_fatal);

        self.update_state(&account_id, |state| {
            state.running = true;
            state.last_start_at = Some(now_ms());
            state.last_error = None;
        });
        Ok(true)
    }

    /// Tear down and remove the account's socket handle. Safe to call from
    /// concurrent supervisory paths; returns false when there was no handle.
    pub fn stop_streaming(&self, account_id: &str) -> bool {
        let client = self.clients.write().unwrap().remove(account_id);
        self.update_state(account_id, |state| {
            state.running = false;
            state.last_stop_at = Some(now_ms());
        });
        match client {
            Some(client) => {
                client.stop();
                info!(account_id, "event socket stopped");
                true
            },
            None => false,
        }
    }

    /// Remove the account's handle only when it is `client` itself.
    fn remove_exact(&self, account_id: &str, client: &FeishuWsClient) -> bool {
        let mut clients = self.clients.write().unwrap();
        if clients
            .get(account_id)
            .is_some_and(|current| current.same_handle(client))
        {
            clients.remove(account_id);
            return true;
        }
        false
    }

    /// Record a fatal transport failure: the socket gave up reconnecting.
    /// A stale report from a superseded handle is ignored.
    pub(crate) fn record_fatal(&self, account_id: &str, client: &FeishuWsClient, message: &str) {
        if !self.remove_exact(account_id, client) {
            return;
        }
        client.stop();
        error!(account_id, error = message, "event socket gave up");
        self.update_state(account_id, |state| {
            state.running = false;
            state.last_stop_at = Some(now_ms());
            state.last_error = Some(message.to_string());
        });
    }
}

#[cfg(test)]
mod tests {
    use {
        serde_json::json,
        tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
        },
    };

    use super::*;
    use crate::config::FeishuConfig;

    fn resolved(config: serde_json::Value) -> ResolvedAccount {
        let cfg: FeishuConfig = serde_json::from_value(config).unwrap();
        cfg.resolve(None)
    }

    fn noop_callback() -> EventCallback {
        Arc::new(|_| Box::pin(async {}))
    }

    #[test]
    fn state_is_created_lazily_with_defaults() {
        let registry = ConnectionRegistry::new();
        let state = registry.state("fresh");
        assert!(!state.running);
        assert!(state.last_start_at.is_none());
        assert!(state.last_error.is_none());
        assert!(state.last_inbound_at.is_none());
    }

    #[test]
    fn stop_without_handle_is_a_safe_noop() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.stop_streaming("ghost"));
        assert!(!registry.stop_streaming("ghost"));
    }

    #[test]
    fn activity_stamps_are_recorded() {
        let registry = ConnectionRegistry::new();
        registry.note_inbound("acct");
        registry.note_outbound("acct");
        let state = registry.state("acct");
        assert!(state.last_inbound_at.is_some());
        assert!(state.last_outbound_at.is_some());
    }

    #[test]
    fn first_seen_suppresses_duplicates_per_account() {
        let registry = ConnectionRegistry::new();
        assert!(registry.first_seen("a", "m1"));
        assert!(!registry.first_seen("a", "m1"));
        // The same message ID on another account is fresh.
        assert!(registry.first_seen("b", "m1"));
    }

    #[test]
    fn dedup_cache_is_bounded() {
        let registry = ConnectionRegistry::new();
        assert!(registry.first_seen("a", "m0"));
        for i in 1..=DEDUP_CAPACITY {
            assert!(registry.first_seen("a", &format!("m{i}")));
        }
        // The oldest entry was evicted and reads as fresh again.
        assert!(registry.first_seen("a", "m0"));
        // A recent one is still remembered.
        let recent = format!("m{DEDUP_CAPACITY}");
        assert!(!registry.first_seen("a", &recent));
    }

    #[tokio::test]
    async fn start_in_http_mode_fails_fast_without_state_changes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let account = resolved(json!({
            "app_id": "cli", "app_secret": "sec", "event_mode": "http"
        }));
        let err = Arc::clone(&registry)
            .start_streaming(&account, &reqwest::Client::new(), noop_callback())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!registry.has_client("default"));
        let state = registry.state("default");
        assert!(!state.running);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn start_disabled_or_unconfigured_fails_fast() {
        let registry = Arc::new(ConnectionRegistry::new());

        let disabled = resolved(json!({
            "enabled": false, "app_id": "cli", "app_secret": "sec"
        }));
        assert!(matches!(
            Arc::clone(&registry)
                .start_streaming(&disabled, &reqwest::Client::new(), noop_callback())
                .await,
            Err(Error::Configuration { .. })
        ));

        let unconfigured = resolved(json!({ "app_id": "cli" }));
        assert!(matches!(
            Arc::clone(&registry)
                .start_streaming(&unconfigured, &reqwest::Client::new(), noop_callback())
                .await,
            Err(Error::Configuration { .. })
        ));
        assert!(!registry.has_client("default"));
    }

    #[tokio::test]
    async fn handshake_failure_discards_handle_and_records_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut server = mockito::Server::new_async().await;
        let _endpoint = server
            .mock("POST", "/callback/ws/endpoint")
            .with_status(200)
            .with_body(json!({ "code": 99991663, "msg": "app not found" }).to_string())
            .create_async()
            .await;

        let account = resolved(json!({
            "app_id": "cli", "app_secret": "sec", "base_url": server.url()
        }));
        let err = Arc::clone(&registry)
            .start_streaming(&account, &reqwest::Client::new(), noop_callback())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(!registry.has_client("default"));

        let state = registry.state("default");
        assert!(!state.running);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn concurrent_starts_yield_exactly_one_handle() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut server = mockito::Server::new_async().await;
        let _endpoint = server
            .mock("POST", "/callback/ws/endpoint")
            .with_status(200)
            .with_body(
                json!({ "code": 0, "msg": "ok", "data": { "url": "ws://127.0.0.1:1" } })
                    .to_string(),
            )
            .create_async()
            .await;

        let account = resolved(json!({
            "app_id": "cli", "app_secret": "sec", "base_url": server.url()
        }));
        let http = reqwest::Client::new();
        let (a, b) = tokio::join!(
            Arc::clone(&registry).start_streaming(&account, &http, noop_callback()),
            Arc::clone(&registry).start_streaming(&account, &http, noop_callback()),
        );
        let started = [a.unwrap(), b.unwrap()];
        assert_eq!(started.iter().filter(|fresh| **fresh).count(), 1);
        assert!(registry.has_client("default"));
        assert!(registry.state("default").running);

        assert!(registry.stop_streaming("default"));
        assert!(!registry.has_client("default"));
        assert!(!registry.state("default").running);
    }

    /// A stop issued while a start is mid-handshake must leave the account
    /// stopped once the start resolves.
    #[tokio::test]
    async fn stop_during_pending_start_lands_stopped() {
        let registry = Arc::new(ConnectionRegistry::new());

        // Hand-rolled endpoint server: accept, stall until the stop has been
        // issued, then answer with a valid endpoint payload.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            let _ = release_rx.await;
            let body = json!({ "code": 0, "data": { "url": "ws://127.0.0.1:1" } }).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });

        let account = resolved(json!({
            "app_id": "cli", "app_secret": "sec", "base_url": format!("http://{addr}")
        }));
        let start = {
            let registry = Arc::clone(&registry);
            let http = reqwest::Client::new();
            tokio::spawn(async move {
                registry
                    .start_streaming(&account, &http, noop_callback())
                    .await
            })
        };

        // Wait for the pending handle to register, then stop the account.
        while !registry.has_client("default") {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert!(registry.stop_streaming("default"));
        let _ = release_tx.send(());

        let resolved_start = start.await.unwrap().unwrap();
        assert!(!resolved_start, "a cancelled start must not report fresh");
        assert!(!registry.has_client("default"));
        assert!(!registry.state("default").running);
    }
}
