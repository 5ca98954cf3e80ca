//! Pairing store for direct-message senders awaiting operator approval.
//!
//! When a DM arrives from a sender who is not on the allow-list under the
//! `pairing` policy, the channel requests a one-time code from the store and
//! sends it back to the sender. An operator approves the code out-of-band,
//! which lands the sender in the persisted allow-from store.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use {async_trait::async_trait, rand::Rng};

use crate::error::Result;

/// How long an issued pairing code stays valid.
const PAIRING_TTL: Duration = Duration::from_secs(300);

/// Pairing and allow-from persistence. External collaborator; the in-memory
/// implementation below backs tests and single-process deployments.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Record a pairing request for a sender. Returns the issued code when a
    /// new challenge was created, or `None` when one is already pending (no
    /// reply should be sent in that case).
    async fn upsert_pairing_request(&self, channel: &str, sender_id: &str)
    -> Result<Option<String>>;

    /// Render the message sent back to an unapproved sender.
    fn build_pairing_reply(&self, channel: &str, id_line: &str, code: &str) -> String;

    /// Read the persisted allow-list for a channel.
    async fn read_allow_from_store(&self, channel: &str) -> Result<Vec<String>>;
}

struct PendingPairing {
    sender_id: String,
    code: String,
    expires_at: Instant,
}

#[derive(Default)]
struct PairingInner {
    /// Pending challenges keyed by `channel:sender`.
    pending: HashMap<String, PendingPairing>,
    /// Approved sender IDs keyed by channel.
    allowed: HashMap<String, HashSet<String>>,
}

/// In-memory [`PairingStore`].
///
/// All operations are synchronous map lookups behind a `std::sync::Mutex`,
/// never held across `.await` points.
#[derive(Default)]
pub struct MemoryPairingStore {
    inner: Mutex<PairingInner>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve a pending code. Returns the sender ID now on the allow-list,
    /// or `None` when no live challenge matches.
    pub fn approve(&self, channel: &str, code: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let key = inner
            .pending
            .iter()
            .find(|(key, p)| {
                key.starts_with(&format!("{channel}:")) && p.code == code && now < p.expires_at
            })
            .map(|(key, _)| key.clone())?;
        let pending = inner.pending.remove(&key)?;
        inner
            .allowed
            .entry(channel.to_string())
            .or_default()
            .insert(pending.sender_id.clone());
        Some(pending.sender_id)
    }

    /// Drop expired challenges.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|_, p| now < p.expires_at);
    }
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn upsert_pairing_request(
        &self,
        channel: &str,
        sender_id: &str,
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let key = format!("{channel}:{sender_id}");

        if let Some(existing) = inner.pending.get(&key) {
            if now < existing.expires_at {
                return Ok(None);
            }
            inner.pending.remove(&key);
        }

        let code = generate_pairing_code();
        inner.pending.insert(key, PendingPairing {
            sender_id: sender_id.to_string(),
            code: code.clone(),
            expires_at: now + PAIRING_TTL,
        });
        Ok(Some(code))
    }

    fn build_pairing_reply(&self, channel: &str, id_line: &str, code: &str) -> String {
        format!(
            "Pairing required. Ask an operator to approve this code for the \
             {channel} channel:\n\n{code}\n\n{id_line}"
        )
    }

    async fn read_allow_from_store(&self, channel: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<String> = inner
            .allowed
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        entries.sort();
        Ok(entries)
    }
}

/// Generate a random 6-digit pairing code.
fn generate_pairing_code() -> String {
    let code: u32 = rand::rng().random_range(100_000..1_000_000);
    code.to_string()
}
