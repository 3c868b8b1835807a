//! Raw TCP ingress router (spec §4.7).
//!
//! Grounded on the same `proxy.rs` channel-open pattern as the HTTP listener,
//! minus any HTTP awareness: the bytes are spliced verbatim.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::server::Handle as SshHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::forwarder;
use crate::registry::ForwardingRecord;

/// Accepts connections on one claimed port for the lifetime of a TCP
/// forwarding record, splicing each to a fresh `forwarded-tcpip` channel.
/// Returns once `cancel` fires or the listener's socket errors out.
pub async fn run_tcp_accept_loop(
    listener: TcpListener,
    handle: SshHandle,
    record: Arc<ForwardingRecord>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    info!(
        "TCP ingress listening on {}:{}",
        record.bind_address, record.bind_port
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("tcp accept error: {}", e); continue; }
                };
                let handle = handle.clone();
                let record = record.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, handle, record, buffer_size).await {
                        debug!("tcp connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    handle: SshHandle,
    record: Arc<ForwardingRecord>,
    buffer_size: usize,
) -> Result<(), TunnelError> {
    let channel = forwarder::open_forwarded_channel(
        &handle,
        &record.bind_address,
        record.bind_port,
        &peer_addr.ip().to_string(),
        peer_addr.port() as u32,
    )
    .await?;

    record.active_channels.fetch_add(1, Ordering::Relaxed);
    let chan_stream = channel.into_stream();
    let result = forwarder::splice_raw(stream, chan_stream, buffer_size, &record.bytes_in, &record.bytes_out).await;
    record.active_channels.fetch_sub(1, Ordering::Relaxed);
    result
}
