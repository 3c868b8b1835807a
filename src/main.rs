//! Gateway bootstrap.
//!
//! Wires the config, server key, registry, port pool and authorizer into the
//! SSH server plus ingress listeners, and (in node mode) a control-plane
//! client instead of the local management API.

use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use tunnl::authorizer::StandaloneAuthorizer;
use tunnl::config::{Config, Mode};
use tunnl::ingress::{run_http_listener, run_https_listener, RouterContext};
use tunnl::port_pool::PortPool;
use tunnl::registry::Registry;
use tunnl::{control_plane, key, management, tls};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if std::env::args().any(|a| a == "--version" || a == "-v") {
        println!("tunnl {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(e) = run().await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    info!("starting tunnl on domain {}", config.domain);

    let server_key = key::load_or_generate_server_key(&config.key_loc)?;

    let registry = Arc::new(Registry::new());
    let port_pool = Arc::new(PortPool::new());
    port_pool.add_range(config.allowed_ports.0, config.allowed_ports.1).await.ok();
    let authorizer = Arc::new(StandaloneAuthorizer);

    let cancel = CancellationToken::new();

    let ssh_config = Arc::new(russh::server::Config {
        methods: russh::MethodSet::PUBLICKEY,
        server_id: russh::SshId::Standard(format!("SSH-2.0-tunnl_{}", env!("CARGO_PKG_VERSION"))),
        keys: vec![server_key],
        inactivity_timeout: Some(std::time::Duration::from_secs(1800)),
        auth_rejection_time: std::time::Duration::from_secs(3),
        auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
        ..Default::default()
    });

    let mut server = tunnl::ssh::TunnelServer::new(
        registry.clone(),
        port_pool.clone(),
        authorizer,
        config.domain.clone(),
        config.allowed_ports,
        config.buffer_size,
    );

    let ssh_addr = format!("0.0.0.0:{}", config.ssh_port);
    info!("SSH listening on {}", ssh_addr);
    let ssh_task = tokio::spawn(async move {
        if let Err(e) = server.run_on_address(ssh_config, ssh_addr).await {
            error!("SSH server exited: {:?}", e);
        }
    });

    let router_ctx = Arc::new(RouterContext {
        registry: registry.clone(),
        domain: config.domain.clone(),
        tls_redirect: config.tls_redirect,
        buffer_size: config.buffer_size,
    });

    let http_addr = format!("0.0.0.0:{}", config.http_port);
    let http_ctx = router_ctx.clone();
    let http_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_http_listener(&http_addr, http_ctx, http_cancel).await {
            error!("HTTP ingress listener exited: {}", e);
        }
    });

    if config.tls_enabled {
        let acceptor = tls::load_acceptor(
            &format!("{}.crt", config.domain),
            &format!("{}.key", config.domain),
        )?;
        let https_addr = format!("0.0.0.0:{}", config.https_port);
        let https_ctx = router_ctx.clone();
        let https_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_https_listener(&https_addr, https_ctx, acceptor, https_cancel).await {
                error!("HTTPS ingress listener exited: {}", e);
            }
        });
    }

    match config.mode {
        Mode::Standalone => {
            let management_addr = format!("0.0.0.0:{}", config.management_port);
            let management_registry = registry.clone();
            tokio::spawn(async move {
                if let Err(e) = management::run_management_api(management_registry, &management_addr).await {
                    error!("management API exited: {}", e);
                }
            });
        }
        Mode::Node => {
            let address = config.grpc_address.clone().unwrap_or_else(|| "127.0.0.1:9000".to_string());
            let token = config.node_token.clone().unwrap_or_default();
            let client = control_plane::ControlPlaneClient::new(address, token, config.domain.clone(), registry.clone());
            let control_cancel = cancel.clone();
            tokio::spawn(async move {
                client.run(control_cancel).await;
            });
        }
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    cancel.cancel();
    ssh_task.abort();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
