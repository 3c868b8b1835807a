//! Control-plane adapter: the bounded interface a `node`-mode gateway uses
//! to talk to an external controller (spec §6).
//!
//! No gRPC crate exists anywhere in the example pack, so the wire format is
//! hand-rolled: each frame is a 4-byte big-endian length prefix followed by
//! a JSON-encoded envelope, matching the corpus's general preference for
//! `serde_json` over inventing a binary framing of its own.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::registry::{ForwardKind, Registry, SessionKey};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Inbound {
    SlugChange { owner: String, old: String, new: String },
    GetSessions { owner: String },
    TerminateSession { owner: String, id: String, kind: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Outbound {
    Auth { token: String },
    Reply { ok: bool, message: String },
    Sessions { sessions: Vec<SessionSnapshot> },
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionSnapshot {
    domain: String,
    kind: String,
    slug: String,
    owner: String,
    active: bool,
    uptime_secs: u64,
}

/// Holds the connection parameters and registry handle this adapter routes
/// inbound events against; `run` owns the reconnect loop.
pub struct ControlPlaneClient {
    address: String,
    token: String,
    domain: String,
    registry: Arc<Registry>,
}

impl ControlPlaneClient {
    pub fn new(address: String, token: String, domain: String, registry: Arc<Registry>) -> Self {
        Self { address, token, domain, registry }
    }

    /// Runs until `cancel` fires, reconnecting with exponential backoff on
    /// disconnect: 1 s doubling to a 30 s cap, reset on successful auth
    /// (spec §6, §9).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        while !cancel.is_cancelled() {
            match self.connect_and_serve(&cancel).await {
                Ok(()) => {
                    info!("control-plane session ended cleanly");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!("control-plane connection lost: {} (retrying in {:?})", e, backoff);
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect_and_serve(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        write_frame(&mut stream, &Outbound::Auth { token: self.token.clone() }).await?;
        info!("control-plane authenticated against {}", self.address);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = read_frame::<Inbound>(&mut stream) => {
                    let reply = self.handle(frame?).await;
                    write_frame(&mut stream, &reply).await?;
                }
            }
        }
    }

    async fn handle(&self, inbound: Inbound) -> Outbound {
        match inbound {
            Inbound::SlugChange { owner, old, new } => {
                let old_key = SessionKey { id: old, kind: ForwardKind::Http };
                let new_key = SessionKey { id: new, kind: ForwardKind::Http };
                match self.registry.update(&owner, &old_key, &new_key).await {
                    Ok(()) => Outbound::Reply { ok: true, message: "renamed".into() },
                    Err(e) => Outbound::Reply { ok: false, message: e.to_string() },
                }
            }
            Inbound::GetSessions { owner } => {
                let sessions = self.registry.list_by_owner(&owner).await;
                let mut snapshots = Vec::new();
                for session in sessions {
                    let forwards = session.forwards.lock().await;
                    for key in forwards.keys() {
                        snapshots.push(SessionSnapshot {
                            domain: self.domain.clone(),
                            kind: format!("{:?}", key.kind),
                            slug: key.id.clone(),
                            owner: session.owner.clone(),
                            active: session.active.load(Ordering::Relaxed),
                            uptime_secs: session.started_at.elapsed().as_secs(),
                        });
                    }
                }
                Outbound::Sessions { sessions: snapshots }
            }
            Inbound::TerminateSession { owner, id, kind } => {
                let forward_kind = match kind.as_str() {
                    "Http" => ForwardKind::Http,
                    "Tcp" => ForwardKind::Tcp,
                    _ => ForwardKind::Unknown,
                };
                let key = SessionKey { id, kind: forward_kind };
                match self.registry.get_with_owner(&owner, &key).await {
                    Some(session) => {
                        session.cancel.cancel();
                        if let Some(handle) = session.handle.clone() {
                            tokio::spawn(async move {
                                if let Err(e) = handle
                                    .disconnect(russh::Disconnect::ByApplication, "terminated via control plane".to_string(), "en".to_string())
                                    .await
                                {
                                    log::debug!("disconnect result: {:?}", e);
                                }
                            });
                        }
                        Outbound::Reply { ok: true, message: "terminated".into() }
                    }
                    None => Outbound::Reply { ok: false, message: "session not found".into() },
                }
            }
        }
    }
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), TunnelError> {
    let body = serde_json::to_vec(value).map_err(|e| TunnelError::MalformedRequest(e.to_string()))?;
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T, TunnelError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TunnelError::MalformedRequest("control-plane frame too large".into()));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| TunnelError::MalformedRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Session;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;
    use tokio::sync::{Mutex, Notify};

    fn fake_session(owner: &str) -> Arc<Session> {
        Arc::new(Session {
            id: "s1".into(),
            owner: owner.into(),
            started_at: Instant::now(),
            active: AtomicBool::new(true),
            handle: None,
            term_size: Mutex::new((80, 24)),
            mode: Mutex::new(crate::registry::InteractiveMode::Status),
            selected: Mutex::new(None),
            edit_buffer: Mutex::new(String::new()),
            forwards: Mutex::new(std::collections::HashMap::new()),
            redraw: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn slug_change_delegates_to_registry_update() {
        let registry = Arc::new(Registry::new());
        let client = ControlPlaneClient::new("unused".into(), "tok".into(), "example.com".into(), registry.clone());

        let session = fake_session("owner1");
        registry.register(SessionKey::http("alpha"), session).await;

        let reply = client
            .handle(Inbound::SlugChange { owner: "owner1".into(), old: "alpha".into(), new: "bravo".into() })
            .await;
        match reply {
            Outbound::Reply { ok, .. } => assert!(ok),
            _ => panic!("wrong reply variant"),
        }
        assert!(registry.get(&SessionKey::http("bravo")).await.is_some());
    }

    #[tokio::test]
    async fn terminate_session_not_found() {
        let registry = Arc::new(Registry::new());
        let client = ControlPlaneClient::new("unused".into(), "tok".into(), "example.com".into(), registry);
        let reply = client
            .handle(Inbound::TerminateSession { owner: "owner1".into(), id: "alpha".into(), kind: "Http".into() })
            .await;
        match reply {
            Outbound::Reply { ok, .. } => assert!(!ok),
            _ => panic!("wrong reply variant"),
        }
    }
}
