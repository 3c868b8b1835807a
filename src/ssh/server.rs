//! SSH server: mints a fresh [`SshHandler`] per inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use russh::server::{Handler, Server};

use super::SshHandler;
use crate::authorizer::Authorizer;
use crate::port_pool::PortPool;
use crate::registry::Registry;

#[derive(Clone)]
pub struct TunnelServer {
    registry: Arc<Registry>,
    port_pool: Arc<PortPool>,
    authorizer: Arc<dyn Authorizer>,
    domain: String,
    tcp_range: (u16, u16),
    buffer_size: usize,
}

impl TunnelServer {
    pub fn new(
        registry: Arc<Registry>,
        port_pool: Arc<PortPool>,
        authorizer: Arc<dyn Authorizer>,
        domain: String,
        tcp_range: (u16, u16),
        buffer_size: usize,
    ) -> Self {
        Self {
            registry,
            port_pool,
            authorizer,
            domain,
            tcp_range,
            buffer_size,
        }
    }
}

impl Server for TunnelServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("new SSH connection from {:?}", peer_addr);
        SshHandler::new(
            self.registry.clone(),
            self.port_pool.clone(),
            self.authorizer.clone(),
            self.domain.clone(),
            self.tcp_range,
            self.buffer_size,
            peer_addr,
        )
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!("session error: {:?}", error);
    }
}
