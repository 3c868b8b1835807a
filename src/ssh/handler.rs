//! Per-connection SSH handler: the state machine of spec §4.8.
//!
//! Grounded on the teacher's `handler.rs` (channel bookkeeping, the
//! shared-mutable-state-behind-a-lock shape, disconnect-on-double-escape),
//! generalized from Device Flow bookkeeping to the tunnel registry/port pool
//! this spec actually needs.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle as SshHandle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect};
use russh_keys::HashAlg;

use crate::authorizer::{AuthDecision, Authorizer};
use crate::error::TunnelError;
use crate::ingress::run_tcp_accept_loop;
use crate::port_pool::PortPool;
use crate::registry::{ForwardKind, ForwardingRecord, InteractiveMode, Registry, SessionKey};
use crate::tui;

use super::types::{generate_http_slug, generate_session_id, SessionPhase};

/// Handler for one inbound SSH connection. Most fields mirror the teacher's
/// `SshHandler` shape; `session` stands in for the teacher's `shared_state`
/// as the single owned handle to this connection's live tunnel state.
pub struct SshHandler {
    registry: Arc<Registry>,
    port_pool: Arc<PortPool>,
    authorizer: Arc<dyn Authorizer>,
    domain: String,
    tcp_range: (u16, u16),
    buffer_size: usize,
    peer_addr: Option<SocketAddr>,

    session_id: String,
    owner: Option<String>,
    phase: SessionPhase,
    session: Option<Arc<crate::registry::Session>>,
    session_channel_id: Option<ChannelId>,
}

impl SshHandler {
    pub fn new(
        registry: Arc<Registry>,
        port_pool: Arc<PortPool>,
        authorizer: Arc<dyn Authorizer>,
        domain: String,
        tcp_range: (u16, u16),
        buffer_size: usize,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            registry,
            port_pool,
            authorizer,
            domain,
            tcp_range,
            buffer_size,
            peer_addr,
            session_id: generate_session_id(),
            owner: None,
            phase: SessionPhase::Opened,
            session: None,
            session_channel_id: None,
        }
    }

    fn classify_port(&self, port: u32) -> bool {
        port == 0 || (self.tcp_range.0 as u32..=self.tcp_range.1 as u32).contains(&port)
    }

    /// Reuses an existing HTTP record if this session already has one;
    /// otherwise mints a random slug and registers it (spec §4.8: "any HTTP
    /// forward collapses to route this slug to me regardless of bind
    /// params").
    async fn register_http_forward(
        &self,
        session: &Arc<crate::registry::Session>,
        address: &str,
        port: u32,
    ) -> bool {
        {
            let forwards = session.forwards.lock().await;
            if forwards.values().any(|r| r.kind == ForwardKind::Http) {
                return true;
            }
        }
        for _ in 0..5 {
            let slug = generate_http_slug();
            let key = SessionKey::http(slug.clone());
            if self.registry.register(key.clone(), session.clone()).await {
                let record = Arc::new(ForwardingRecord::new(
                    ForwardKind::Http,
                    slug,
                    address.to_string(),
                    port,
                ));
                session.forwards.lock().await.insert(key, record);
                return true;
            }
        }
        false
    }

    fn spawn_redraw_loop(session: Arc<crate::registry::Session>, domain: String, channel_id: ChannelId) {
        tokio::spawn(async move {
            loop {
                session.redraw.notified().await;
                if !session.active.load(Ordering::Relaxed) {
                    return;
                }
                let Ok(bytes) = tui::render(&session, &domain).await else {
                    continue;
                };
                let Some(handle) = session.handle.clone() else {
                    return;
                };
                if handle.data(channel_id, bytes.into()).await.is_err() {
                    return;
                }
            }
        });
    }

    async fn redraw(&self, ssh_session: &mut Session) -> Result<(), TunnelError> {
        let (Some(session), Some(channel_id)) = (&self.session, self.session_channel_id) else {
            return Ok(());
        };
        let bytes = tui::render(session, &self.domain).await?;
        ssh_session
            .data(channel_id, bytes.into())
            .map_err(|_| TunnelError::TransportClosed)?;
        Ok(())
    }

    /// Tears down every forwarding record this session owns and returns its
    /// ports/slugs to their pools (spec §4.8 Closing transition, minus the
    /// SSH-transport disconnect itself, which callers issue separately when
    /// the drop is operator-initiated rather than client-initiated).
    async fn cleanup_session(&mut self) {
        self.phase = SessionPhase::Closing;
        if let Some(session) = self.session.take() {
            session.active.store(false, Ordering::Relaxed);
            session.cancel.cancel();
            let forwards = session.forwards.lock().await;
            for (key, record) in forwards.iter() {
                record.accept_cancel.cancel();
                self.registry.remove(key).await;
                if record.kind == ForwardKind::Tcp {
                    if let Ok(port) = u16::try_from(record.bind_port) {
                        self.port_pool.release(port).await;
                    }
                }
            }
            info!("session {} closed, released {} forwards", session.id, forwards.len());
        }
        self.phase = SessionPhase::Closed;
    }

    async fn drop_session(&mut self) {
        if let Some(session) = &self.session {
            if let Some(handle) = session.handle.clone() {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "session dropped".to_string(), "en".to_string())
                    .await;
            }
        }
        self.cleanup_session().await;
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = TunnelError;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        info!("public key auth attempt: user='{}' fingerprint='{}'", user, fingerprint);
        match self.authorizer.authorize(&fingerprint, user).await {
            AuthDecision::Accept { owner } => {
                self.owner = Some(owner);
                Ok(Auth::Accept)
            }
            AuthDecision::Reject => Ok(Auth::Reject { proceed_with_methods: None }),
        }
    }

    async fn auth_succeeded(&mut self, ssh_session: &mut Session) -> Result<(), Self::Error> {
        let owner = self.owner.clone().unwrap_or_else(|| crate::registry::UNAUTHORIZED_OWNER.to_string());
        let handle = ssh_session.handle();
        info!("authentication succeeded for owner '{}'", owner);
        self.session = Some(crate::registry::Session::new(self.session_id.clone(), owner, handle));
        Ok(())
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _ssh_session: &mut Session) -> Result<bool, Self::Error> {
        let Some(session) = self.session.clone() else {
            warn!("tcpip-forward before authentication completed; rejecting");
            return Ok(false);
        };

        if self.classify_port(*port) {
            let (claimed_port, ok) = if *port == 0 {
                self.port_pool.unassigned().await
            } else {
                let requested = *port as u16;
                (requested, self.port_pool.claim(requested).await)
            };
            if !ok {
                return Ok(false);
            }

            let listener = match tokio::net::TcpListener::bind(("0.0.0.0", claimed_port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!("failed to bind tcp forward port {}: {}", claimed_port, e);
                    self.port_pool.release(claimed_port).await;
                    return Ok(false);
                }
            };

            let key = SessionKey::tcp(claimed_port);
            let record = Arc::new(ForwardingRecord::new(
                ForwardKind::Tcp,
                claimed_port.to_string(),
                address.to_string(),
                claimed_port as u32,
            ));
            if !self.registry.register(key.clone(), session.clone()).await {
                self.port_pool.release(claimed_port).await;
                return Ok(false);
            }
            session.forwards.lock().await.insert(key, record.clone());

            let Some(handle) = session.handle.clone() else {
                self.registry.remove(&SessionKey::tcp(claimed_port)).await;
                self.port_pool.release(claimed_port).await;
                return Ok(false);
            };
            let cancel = record.accept_cancel.clone();
            let buffer_size = self.buffer_size;
            tokio::spawn(async move {
                if let Err(e) = run_tcp_accept_loop(listener, handle, record, buffer_size, cancel).await {
                    warn!("tcp accept loop for forward ended: {}", e);
                }
            });

            *port = claimed_port as u32;
            Ok(true)
        } else {
            Ok(self.register_http_forward(&session, address, *port).await)
        }
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _ssh_session: &mut Session) -> Result<bool, Self::Error> {
        let Some(session) = self.session.clone() else {
            return Ok(false);
        };

        if self.tcp_range.0 as u32 <= port && port <= self.tcp_range.1 as u32 {
            let key = SessionKey::tcp(port as u16);
            let mut forwards = session.forwards.lock().await;
            if let Some(record) = forwards.remove(&key) {
                record.accept_cancel.cancel();
                drop(forwards);
                self.registry.remove(&key).await;
                self.port_pool.release(port as u16).await;
                return Ok(true);
            }
            Ok(false)
        } else {
            let mut forwards = session.forwards.lock().await;
            let key = forwards
                .iter()
                .find(|(_, r)| r.kind == ForwardKind::Http && r.bind_address == address && r.bind_port == port)
                .map(|(k, _)| k.clone());
            match key {
                Some(key) => {
                    forwards.remove(&key);
                    drop(forwards);
                    self.registry.remove(&key).await;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _ssh_session: &mut Session) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        info!("session channel opened: {:?}", channel_id);
        self.session_channel_id = Some(channel_id);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        ssh_session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(session) = &self.session {
            *session.term_size.lock().await = (col_width, row_height);
        }
        ssh_session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _ssh_session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(session) = &self.session {
            *session.term_size.lock().await = (col_width, row_height);
            session.redraw.notify_waiters();
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, ssh_session: &mut Session) -> Result<(), Self::Error> {
        ssh_session.channel_success(channel)?;
        self.phase = SessionPhase::Interactive;

        if let Some(session) = self.session.clone() {
            self.register_http_forward(&session, "", 0).await;
            Self::spawn_redraw_loop(session, self.domain.clone(), channel);
        }
        self.redraw(ssh_session).await
    }

    async fn exec_request(&mut self, channel: ChannelId, _data: &[u8], ssh_session: &mut Session) -> Result<(), Self::Error> {
        ssh_session.channel_success(channel)?;
        self.phase = SessionPhase::Interactive;
        if let Some(session) = self.session.clone() {
            self.register_http_forward(&session, "", 0).await;
            Self::spawn_redraw_loop(session, self.domain.clone(), channel);
        }
        self.redraw(ssh_session).await
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], ssh_session: &mut Session) -> Result<(), Self::Error> {
        if self.session_channel_id != Some(channel) {
            debug!("data on non-session channel {:?} ignored", channel);
            return Ok(());
        }
        let Some(session) = self.session.clone() else {
            return Ok(());
        };

        for &byte in data {
            let ch = byte as char;
            let mode = *session.mode.lock().await;
            match mode {
                InteractiveMode::Status => match ch {
                    'e' => {
                        let selected = {
                            let forwards = session.forwards.lock().await;
                            forwards.keys().find(|k| k.kind == ForwardKind::Http).cloned()
                        };
                        if let Some(key) = selected {
                            *session.edit_buffer.lock().await = key.id.clone();
                            *session.selected.lock().await = Some(key);
                            *session.mode.lock().await = InteractiveMode::EditSlug;
                        }
                    }
                    'd' => *session.mode.lock().await = InteractiveMode::ConfirmDrop,
                    'q' => {
                        self.drop_session().await;
                        return Ok(());
                    }
                    _ => {}
                },
                InteractiveMode::EditSlug => {
                    let owner = session.owner.clone();
                    tui::edit_slug_keystroke(&session, &owner, &self.registry, ch).await;
                }
                InteractiveMode::ConfirmDrop => match ch {
                    'y' => {
                        self.drop_session().await;
                        return Ok(());
                    }
                    'n' => *session.mode.lock().await = InteractiveMode::Status,
                    _ => {}
                },
            }
        }

        self.redraw(ssh_session).await
    }

    async fn channel_eof(&mut self, channel: ChannelId, _ssh_session: &mut Session) -> Result<(), Self::Error> {
        debug!("EOF on channel {:?}", channel);
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _ssh_session: &mut Session) -> Result<(), Self::Error> {
        if self.session_channel_id == Some(channel) {
            info!("session channel {:?} closed, cleaning up", channel);
            self.cleanup_session().await;
        } else {
            debug!("forwarded channel {:?} closed", channel);
        }
        Ok(())
    }
}
