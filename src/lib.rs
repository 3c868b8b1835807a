//! SSH reverse-tunnel gateway library.
//!
//! Provides the components a standalone or node-mode gateway binary wires
//! together: session registry, SSH control-channel core, ingress listeners,
//! forwarder, and the local management/control-plane surfaces.

pub mod authorizer;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod forwarder;
pub mod http;
pub mod ingress;
pub mod key;
pub mod management;
pub mod port_pool;
pub mod registry;
pub mod slug;
pub mod ssh;
pub mod tls;
pub mod tui;

pub use authorizer::{AuthDecision, Authorizer, StandaloneAuthorizer};
pub use config::{Config, Mode};
pub use control_plane::ControlPlaneClient;
pub use error::TunnelError;
pub use key::load_or_generate_server_key;
pub use management::run_management_api;
pub use port_pool::PortPool;
pub use registry::Registry;
pub use ssh::{SshHandler, TunnelServer};
