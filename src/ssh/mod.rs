//! SSH server module.

mod handler;
mod server;
mod types;

pub use handler::SshHandler;
pub use server::TunnelServer;
pub use types::SessionPhase;
