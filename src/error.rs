//! Error kinds visible at the core boundary.

use thiserror::Error;

/// Domain errors produced by the gateway core.
///
/// Propagation follows spec §7: ingress-pairing errors terminate that pairing
/// only, global-request failures reply with SSH failure but keep the session
/// alive, and registry errors are returned to the caller rather than
/// unwinding the session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("slug not found: {0}")]
    SlugNotFound(String),

    #[error("slug already in use: {0}")]
    SlugInUse(String),

    #[error("forbidden slug: {0}")]
    ForbiddenSlug(String),

    #[error("invalid slug: {0}")]
    InvalidSlug(String),

    #[error("slug unchanged")]
    SlugUnchanged,

    #[error("slug rename not allowed for this forwarding kind")]
    SlugRenameNotAllowedForKind,

    #[error("session not found")]
    SessionNotFound,

    #[error("no port available")]
    PortUnavailable,

    #[error("channel open timed out")]
    ChannelOpenTimeout,

    #[error("channel open refused")]
    ChannelOpenRefused,

    #[error("transport closed")]
    TransportClosed,

    #[error("middleware failed: {0}")]
    MiddlewareFailed(String),

    #[error("TLS handshake failed: {0}")]
    TLSHandshakeFailed(String),

    #[error("malformed peer address: {0}")]
    MalformedAddr(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Registry-specific outcomes for [`crate::registry::Registry::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    NotFound,
    SlugInUse,
    Forbidden,
    Invalid,
    Unchanged,
    NotAllowed,
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateError::NotFound => "not found",
            UpdateError::SlugInUse => "slug in use",
            UpdateError::Forbidden => "forbidden slug",
            UpdateError::Invalid => "invalid slug",
            UpdateError::Unchanged => "unchanged",
            UpdateError::NotAllowed => "not allowed for this kind",
        };
        f.write_str(s)
    }
}

impl From<UpdateError> for TunnelError {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::NotFound => TunnelError::SessionNotFound,
            UpdateError::SlugInUse => TunnelError::SlugInUse(String::new()),
            UpdateError::Forbidden => TunnelError::ForbiddenSlug(String::new()),
            UpdateError::Invalid => TunnelError::InvalidSlug(String::new()),
            UpdateError::Unchanged => TunnelError::SlugUnchanged,
            UpdateError::NotAllowed => TunnelError::SlugRenameNotAllowedForKind,
        }
    }
}
