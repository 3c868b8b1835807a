//! Ingress listeners: HTTP/HTTPS vhost routing and raw TCP splicing
//! (spec §4.6, §4.7).

pub mod http_listener;
pub mod tcp_listener;

use std::sync::Arc;

use crate::registry::Registry;

/// Shared, read-mostly context every ingress connection routes against.
pub struct RouterContext {
    pub registry: Arc<Registry>,
    pub domain: String,
    pub tls_redirect: bool,
    pub buffer_size: usize,
}

pub use http_listener::{run_http_listener, run_https_listener};
pub use tcp_listener::run_tcp_accept_loop;
