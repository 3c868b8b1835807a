//! Dual-indexed session registry (spec §3, §4.2, §8).
//!
//! Grounded on the teacher's `AppState` in `state.rs` — a single
//! `RwLock`-guarded map shared via `Arc`, with `register`/`remove`/`get`
//! operations returning `Result<_, TunnelError>` — generalized to the
//! owner-scoped dual index spec §3 requires plus an atomic rename.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::info;
use russh::server::Handle as SshHandle;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::UpdateError;
use crate::slug::{self, SlugVerdict};

pub const UNAUTHORIZED_OWNER: &str = "UNAUTHORIZED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Http,
    Tcp,
    Unknown,
}

/// `(id, kind)` pair. Uniqueness is per-kind: only HTTP keys (slugs) are
/// unique within the registry; TCP keys (ports) are unique because the port
/// pool only ever hands out one claim per port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: String,
    pub kind: ForwardKind,
}

impl SessionKey {
    pub fn http(slug: impl Into<String>) -> Self {
        Self {
            id: slug.into(),
            kind: ForwardKind::Http,
        }
    }

    pub fn tcp(port: u16) -> Self {
        Self {
            id: port.to_string(),
            kind: ForwardKind::Tcp,
        }
    }
}

/// A fact that a session has bound a public ingress (spec §3).
pub struct ForwardingRecord {
    pub kind: ForwardKind,
    pub key: Mutex<String>,
    /// `bind_addr`/`bind_port` as echoed back from the client's
    /// `tcpip-forward` global request.
    pub bind_address: String,
    pub bind_port: u32,
    /// Cancels the TCP accept loop (kind = Tcp only).
    pub accept_cancel: tokio_util::sync::CancellationToken,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub active_channels: AtomicU64,
}

impl ForwardingRecord {
    pub fn new(kind: ForwardKind, key: String, bind_address: String, bind_port: u32) -> Self {
        Self {
            kind,
            key: Mutex::new(key),
            bind_address,
            bind_port,
            accept_cancel: tokio_util::sync::CancellationToken::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            active_channels: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractiveMode {
    Status,
    EditSlug,
    ConfirmDrop,
}

/// A single SSH connection (spec §3).
pub struct Session {
    pub id: String,
    pub owner: String,
    pub started_at: Instant,
    pub active: AtomicBool,
    /// `None` only in unit tests that never open a real SSH transport.
    pub handle: Option<SshHandle>,
    pub term_size: Mutex<(u32, u32)>,
    pub mode: Mutex<InteractiveMode>,
    /// The record selected for `EditSlug`/`ConfirmDrop`, and the in-progress
    /// line-edit buffer for `EditSlug` (spec §4.10).
    pub selected: Mutex<Option<SessionKey>>,
    pub edit_buffer: Mutex<String>,
    /// Forwarding records this session owns, keyed the same way the registry
    /// keys them (spec §3: "a bag of forwarding records").
    pub forwards: Mutex<HashMap<SessionKey, Arc<ForwardingRecord>>>,
    /// Signalled whenever the registry renames this session's slug or the
    /// controller pushes a rename, so the renderer can repaint on next tick
    /// (spec §5: may arrive out of order w.r.t. byte traffic).
    pub redraw: Notify,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl Session {
    pub fn new(id: String, owner: String, handle: SshHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            started_at: Instant::now(),
            active: AtomicBool::new(true),
            handle: Some(handle),
            term_size: Mutex::new((80, 24)),
            mode: Mutex::new(InteractiveMode::Status),
            selected: Mutex::new(None),
            edit_buffer: Mutex::new(String::new()),
            forwards: Mutex::new(HashMap::new()),
            redraw: Notify::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }
}

#[derive(Default)]
struct State {
    by_owner: HashMap<String, HashMap<SessionKey, Arc<Session>>>,
    slug_index: HashMap<SessionKey, String>,
}

/// Dual-indexed store of live sessions, consistent under one lock (spec §3).
pub struct Registry {
    state: RwLock<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Atomically reserves `key` for `session`. `false` if already present —
    /// state is left untouched in that case.
    pub async fn register(&self, key: SessionKey, session: Arc<Session>) -> bool {
        let mut state = self.state.write().await;
        if state.slug_index.contains_key(&key) {
            return false;
        }
        state.slug_index.insert(key.clone(), session.owner.clone());
        state
            .by_owner
            .entry(session.owner.clone())
            .or_default()
            .insert(key, session);
        true
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let state = self.state.read().await;
        let owner = state.slug_index.get(key)?;
        state.by_owner.get(owner)?.get(key).cloned()
    }

    pub async fn get_with_owner(&self, owner: &str, key: &SessionKey) -> Option<Arc<Session>> {
        let state = self.state.read().await;
        state.by_owner.get(owner)?.get(key).cloned()
    }

    /// Atomic rename. See spec §4.2 for the exact (slightly counter-intuitive)
    /// error-precedence rules, preserved verbatim from the source.
    pub async fn update(
        &self,
        owner: &str,
        old: &SessionKey,
        new: &SessionKey,
    ) -> Result<(), UpdateError> {
        if old.kind != new.kind {
            return Err(UpdateError::Unchanged);
        }
        if new.kind != ForwardKind::Http {
            return Err(UpdateError::NotAllowed);
        }
        match slug::classify(&new.id) {
            SlugVerdict::Forbidden => return Err(UpdateError::Forbidden),
            SlugVerdict::Invalid => return Err(UpdateError::Invalid),
            SlugVerdict::Valid => {}
        }

        let mut state = self.state.write().await;

        let session = state
            .by_owner
            .get(owner)
            .and_then(|m| m.get(old))
            .cloned()
            .ok_or(UpdateError::NotFound)?;

        if new != old && state.slug_index.contains_key(new) {
            return Err(UpdateError::SlugInUse);
        }

        if new != old {
            state.slug_index.remove(old);
            state.slug_index.insert(new.clone(), owner.to_string());
            if let Some(bucket) = state.by_owner.get_mut(owner) {
                bucket.remove(old);
                bucket.insert(new.clone(), session.clone());
            }

            let mut forwards = session.forwards.lock().await;
            if let Some(record) = forwards.remove(old) {
                *record.key.lock().await = new.id.clone();
                forwards.insert(new.clone(), record);
            }
        }

        drop(state);
        session.redraw.notify_waiters();
        info!("renamed {:?} -> {:?} for owner {}", old, new, owner);
        Ok(())
    }

    /// Idempotent; prunes the owner bucket if it becomes empty.
    pub async fn remove(&self, key: &SessionKey) {
        let mut state = self.state.write().await;
        let Some(owner) = state.slug_index.remove(key) else {
            return;
        };
        if let Some(bucket) = state.by_owner.get_mut(&owner) {
            bucket.remove(key);
            if bucket.is_empty() {
                state.by_owner.remove(&owner);
            }
        }
    }

    /// Non-empty set of distinct sessions owned by `owner`; empty if none.
    pub async fn list_by_owner(&self, owner: &str) -> Vec<Arc<Session>> {
        let state = self.state.read().await;
        let Some(bucket) = state.by_owner.get(owner) else {
            return Vec::new();
        };
        let mut seen = std::collections::HashSet::new();
        bucket
            .values()
            .filter(|s| seen.insert(s.id.clone()))
            .cloned()
            .collect()
    }

    /// Snapshot across all owners, for the control-plane `GetSessions` call
    /// and the management API (spec §6).
    pub async fn list_all(&self) -> Vec<Arc<Session>> {
        let state = self.state.read().await;
        let mut seen = std::collections::HashSet::new();
        state
            .by_owner
            .values()
            .flat_map(|m| m.values())
            .filter(|s| seen.insert(s.id.clone()))
            .cloned()
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_session(id: &str, owner: &str) -> Arc<Session> {
        // Tests never touch `handle`'s SSH behavior, only registry bookkeeping,
        // so an unconnected handle is sufficient here.
        Arc::new(Session {
            id: id.to_string(),
            owner: owner.to_string(),
            started_at: Instant::now(),
            active: AtomicBool::new(true),
            handle: None,
            term_size: Mutex::new((80, 24)),
            mode: Mutex::new(InteractiveMode::Status),
            selected: Mutex::new(None),
            edit_buffer: Mutex::new(String::new()),
            forwards: Mutex::new(HashMap::new()),
            redraw: Notify::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn register_then_get_roundtrips() {
        let reg = Registry::new();
        let s = fake_session("s1", "owner1");
        let key = SessionKey::http("alpha");
        assert!(reg.register(key.clone(), s.clone()).await);
        assert!(reg.get(&key).await.is_some());

        // second register with same key fails and does not alter state
        let s2 = fake_session("s2", "owner2");
        assert!(!reg.register(key.clone(), s2).await);
        assert_eq!(reg.get(&key).await.unwrap().id, "s1");
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_prunes_owner() {
        let reg = Registry::new();
        let s = fake_session("s1", "owner1");
        let key = SessionKey::http("alpha");
        reg.register(key.clone(), s).await;

        reg.remove(&key).await;
        assert!(reg.get(&key).await.is_none());
        assert!(reg.list_by_owner("owner1").await.is_empty());

        // idempotent
        reg.remove(&key).await;
    }

    #[tokio::test]
    async fn update_moves_atomically() {
        let reg = Registry::new();
        let s = fake_session("s1", "owner1");
        let old = SessionKey::http("alpha");
        reg.register(old.clone(), s.clone()).await;

        let new = SessionKey::http("bravo");
        reg.update("owner1", &old, &new).await.unwrap();

        assert!(reg.get(&old).await.is_none());
        assert!(reg.get(&new).await.is_some());
    }

    #[tokio::test]
    async fn update_rejects_slug_in_use() {
        let reg = Registry::new();
        let s1 = fake_session("s1", "owner1");
        let s2 = fake_session("s2", "owner2");
        let alpha = SessionKey::http("alpha");
        let bravo = SessionKey::http("bravo");
        reg.register(alpha.clone(), s1).await;
        reg.register(bravo.clone(), s2).await;

        let err = reg.update("owner1", &alpha, &bravo).await.unwrap_err();
        assert_eq!(err, UpdateError::SlugInUse);
        // state unchanged
        assert!(reg.get(&alpha).await.is_some());
        assert!(reg.get(&bravo).await.is_some());
    }

    #[tokio::test]
    async fn update_rejects_forbidden_and_invalid() {
        let reg = Registry::new();
        let s = fake_session("s1", "owner1");
        let old = SessionKey::http("alpha");
        reg.register(old.clone(), s).await;

        let forbidden = SessionKey::http("admin");
        assert_eq!(
            reg.update("owner1", &old, &forbidden).await.unwrap_err(),
            UpdateError::Forbidden
        );
        assert!(reg.get(&old).await.is_some());

        let invalid = SessionKey::http("a");
        assert_eq!(
            reg.update("owner1", &old, &invalid).await.unwrap_err(),
            UpdateError::Invalid
        );
    }

    #[tokio::test]
    async fn update_rejects_non_http_kind() {
        let reg = Registry::new();
        let s = fake_session("s1", "owner1");
        let old = SessionKey::tcp(4000);
        reg.register(old.clone(), s).await;

        let new = SessionKey::tcp(4001);
        assert_eq!(
            reg.update("owner1", &old, &new).await.unwrap_err(),
            UpdateError::NotAllowed
        );
    }

    #[tokio::test]
    async fn slug_in_slug_index_iff_in_exactly_one_owner_bucket() {
        let reg = Registry::new();
        let s = fake_session("s1", "owner1");
        let key = SessionKey::http("alpha");
        reg.register(key.clone(), s).await;

        let state = reg.state.read().await;
        let owner = state.slug_index.get(&key).cloned().unwrap();
        assert_eq!(owner, "owner1");
        assert!(state.by_owner[&owner].contains_key(&key));
    }
}
