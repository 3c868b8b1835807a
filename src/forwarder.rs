//! Opens `forwarded-tcpip` SSH channels and splices ingress bytes against
//! them (spec §4.9).
//!
//! Grounded on the teacher's `proxy.rs` (`tunnel.handle.channel_open_forwarded_tcpip`,
//! `channel.into_stream()` for the splice) generalized with the timeout-race
//! and orphan-cleanup pattern from spec §9.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use russh::server::{Handle as SshHandle, Msg};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::TunnelError;

const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Races a `forwarded-tcpip` channel open against a 5 s deadline. If the
/// deadline wins, the still-running worker's eventual channel (if it arrives
/// late) is closed instead of leaking.
pub async fn open_forwarded_channel(
    handle: &SshHandle,
    bind_address: &str,
    bind_port: u32,
    origin_addr: &str,
    origin_port: u32,
) -> Result<Channel<Msg>, TunnelError> {
    let (tx, rx) = oneshot::channel();
    let handle = handle.clone();
    let bind_address = bind_address.to_string();
    let origin_addr = origin_addr.to_string();

    tokio::spawn(async move {
        let result = handle
            .channel_open_forwarded_tcpip(&bind_address, bind_port, &origin_addr, origin_port)
            .await;
        if let Err(Ok(mut orphan)) = tx.send(result) {
            warn!("channel open arrived after timeout, closing orphan");
            let _ = orphan.close().await;
        }
    });

    match timeout(CHANNEL_OPEN_TIMEOUT, rx).await {
        Ok(Ok(Ok(channel))) => Ok(channel),
        Ok(Ok(Err(e))) => {
            warn!("forwarded-tcpip channel open refused: {:?}", e);
            Err(TunnelError::ChannelOpenRefused)
        }
        Ok(Err(_)) => Err(TunnelError::TransportClosed),
        Err(_) => Err(TunnelError::ChannelOpenTimeout),
    }
}

/// Bidirectional raw byte copy between an ingress stream and an upstream
/// channel stream, with a pooled fixed-size buffer per direction (spec §4.9).
/// Used directly by the TCP ingress router; the HTTP ingress router performs
/// its own splice loop through the header rewriter instead.
pub async fn splice_raw<A, B>(
    mut ingress: A,
    mut upstream: B,
    buf_size: usize,
    bytes_in: &AtomicU64,
    bytes_out: &AtomicU64,
) -> Result<(), TunnelError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ir, mut iw) = tokio::io::split(&mut ingress);
    let (mut ur, mut uw) = tokio::io::split(&mut upstream);

    let to_upstream = async {
        let mut buf = vec![0u8; buf_size];
        loop {
            let n = ir.read(&mut buf).await?;
            if n == 0 {
                let _ = uw.shutdown().await;
                return Ok::<(), std::io::Error>(());
            }
            uw.write_all(&buf[..n]).await?;
            bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    let to_ingress = async {
        let mut buf = vec![0u8; buf_size];
        loop {
            let n = ur.read(&mut buf).await?;
            if n == 0 {
                let _ = iw.shutdown().await;
                return Ok::<(), std::io::Error>(());
            }
            iw.write_all(&buf[..n]).await?;
            bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    let result = tokio::try_join!(to_upstream, to_ingress);
    debug!("splice finished: {:?}", result.as_ref().err());
    result.map(|_| ()).map_err(TunnelError::Io)
}

/// Clamp a configured buffer size into the spec's allowed range.
pub fn clamp_buffer_size(requested: usize) -> usize {
    requested.clamp(4096, 1_048_576)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_buffer_size_bounds() {
        assert_eq!(clamp_buffer_size(100), 4096);
        assert_eq!(clamp_buffer_size(10_000_000), 1_048_576);
        assert_eq!(clamp_buffer_size(65536), 65536);
    }

    #[tokio::test]
    async fn splice_raw_copies_both_directions() {
        use tokio::io::duplex;

        let (ingress, mut ingress_peer) = duplex(64);
        let (upstream, mut upstream_peer) = duplex(64);

        let bytes_in = AtomicU64::new(0);
        let bytes_out = AtomicU64::new(0);

        let splice = tokio::spawn(async move {
            splice_raw(ingress, upstream, 16, &bytes_in, &bytes_out)
                .await
                .ok();
            (bytes_in.load(Ordering::Relaxed), bytes_out.load(Ordering::Relaxed))
        });

        ingress_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_peer.write_all(b"world").await.unwrap();
        let mut buf2 = [0u8; 5];
        ingress_peer.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"world");

        drop(ingress_peer);
        drop(upstream_peer);
        let _ = splice.await;
    }
}
