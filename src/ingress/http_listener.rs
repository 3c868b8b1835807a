//! HTTP/HTTPS ingress router (spec §4.6).
//!
//! Grounded on the teacher's `proxy.rs` hyper-based request/response flow,
//! rewritten around a raw `TcpStream`/`TlsStream` instead of hyper, because
//! the byte-level splice this spec needs (§4.4) can't be expressed through
//! hyper's typed body API.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::forwarder;
use crate::http::{HeaderCapable, HttpRewriter, MiddlewareChain, RequestHeader};
use crate::ingress::RouterContext;
use crate::registry::{ForwardKind, SessionKey};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const PING_SLUG: &str = "ping";

pub async fn run_http_listener(
    addr: &str,
    ctx: Arc<RouterContext>,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP ingress listening on {}", addr);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("http accept error: {}", e); continue; }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, false, ctx).await {
                        debug!("http connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
        }
    }
}

pub async fn run_https_listener(
    addr: &str,
    ctx: Arc<RouterContext>,
    acceptor: TlsAcceptor,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTPS ingress listening on {}", addr);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("https accept error: {}", e); continue; }
                };
                let ctx = ctx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls_stream = match crate::tls::accept(&acceptor, stream).await {
                        Ok(s) => s,
                        Err(e) => { warn!("tls handshake with {} failed: {}", peer_addr, e); return; }
                    };
                    if let Err(e) = handle_connection(tls_stream, peer_addr, true, ctx).await {
                        debug!("https connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    is_tls: bool,
    ctx: Arc<RouterContext>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);

    let req = match read_bounded_request(&mut reader).await {
        Ok(req) => req,
        Err(_) => {
            let mut stream = reader.into_inner();
            write_simple(&mut stream, 400, "Bad Request", &[], b"").await?;
            return Ok(());
        }
    };

    let Some(requested_slug) = req.host_slug() else {
        let mut stream = reader.into_inner();
        write_simple(&mut stream, 400, "Bad Request", &[], b"").await?;
        return Ok(());
    };

    // §9 resolution: `ping` short-circuits before the TLS redirect check.
    if requested_slug == PING_SLUG {
        let mut stream = reader.into_inner();
        write_simple(
            &mut stream,
            200,
            "OK",
            &[
                ("Content-Length", "0"),
                ("Connection", "close"),
                ("Access-Control-Allow-Origin", "*"),
                ("Access-Control-Allow-Methods", "*"),
                ("Access-Control-Allow-Headers", "*"),
            ],
            b"",
        )
        .await?;
        return Ok(());
    }

    if !is_tls && ctx.tls_redirect {
        let location = format!("https://{}.{}/", requested_slug, ctx.domain);
        let mut stream = reader.into_inner();
        write_simple(&mut stream, 301, "Moved Permanently", &[("Location", &location)], b"").await?;
        return Ok(());
    }

    let key = SessionKey {
        id: requested_slug.clone(),
        kind: ForwardKind::Http,
    };

    let Some(session) = ctx.registry.get(&key).await else {
        let location = format!("https://{}/tunnel-not-found?slug={}", ctx.domain, requested_slug);
        let mut stream = reader.into_inner();
        write_simple(&mut stream, 301, "Moved Permanently", &[("Location", &location)], b"").await?;
        return Ok(());
    };

    let record = {
        let forwards = session.forwards.lock().await;
        forwards.get(&key).cloned()
    };
    let Some(record) = record else {
        let mut stream = reader.into_inner();
        write_simple(&mut stream, 502, "Bad Gateway", &[], b"").await?;
        return Ok(());
    };
    let Some(handle) = session.handle.as_ref() else {
        let mut stream = reader.into_inner();
        write_simple(&mut stream, 502, "Bad Gateway", &[], b"").await?;
        return Ok(());
    };

    let channel = forwarder::open_forwarded_channel(
        handle,
        &record.bind_address,
        record.bind_port,
        &peer_addr.ip().to_string(),
        peer_addr.port() as u32,
    )
    .await;

    let channel = match channel {
        Ok(c) => c,
        Err(e) => {
            warn!("upstream channel open failed for slug {}: {}", requested_slug, e);
            let mut stream = reader.into_inner();
            write_simple(&mut stream, 502, "Bad Gateway", &[], b"").await?;
            return Ok(());
        }
    };

    record.active_channels.fetch_add(1, Ordering::Relaxed);

    let chain = Arc::new(MiddlewareChain::standard());
    let mut req = req;
    chain.run_request(&mut req, &peer_addr.to_string())?;

    let chan_stream = channel.into_stream();
    let (mut chan_read, mut chan_write) = tokio::io::split(chan_stream);

    chan_write.write_all(&req.finalize()).await?;

    // `reader` may already have buffered bytes past the blank header line
    // (a body arriving in the same TCP segment as the headers, the common
    // case for POST/PUT): `into_inner()` would otherwise silently drop them.
    let leftover = reader.buffer().to_vec();
    if !leftover.is_empty() {
        chan_write.write_all(&leftover).await?;
        record.bytes_in.fetch_add(leftover.len() as u64, Ordering::Relaxed);
    }

    let ingress_stream = reader.into_inner();
    let (ingress_read, ingress_write) = tokio::io::split(ingress_stream);
    let rewriter = HttpRewriter::new(ingress_read, ingress_write, chain, peer_addr.to_string())
        .without_initial_classification();
    let (mut read_side, mut write_side) = rewriter.split();

    let buffer_size = ctx.buffer_size;
    let record_for_upstream = record.clone();
    let record_for_ingress = record.clone();

    let to_upstream = async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = read_side.read(&mut buf).await?;
            if n == 0 {
                let _ = chan_write.shutdown().await;
                return Ok::<(), TunnelError>(());
            }
            chan_write.write_all(&buf[..n]).await?;
            record_for_upstream.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    let to_ingress = async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = chan_read.read(&mut buf).await?;
            if n == 0 {
                let _ = write_side.close_write().await;
                return Ok::<(), TunnelError>(());
            }
            write_side.write(&buf[..n]).await?;
            record_for_ingress.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    let result = tokio::try_join!(to_upstream, to_ingress);
    record.active_channels.fetch_sub(1, Ordering::Relaxed);
    result.map(|_| ())
}

async fn read_bounded_request<R>(reader: &mut R) -> Result<RequestHeader, TunnelError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    // The size ceiling is enforced line-by-line inside `parse_from_reader`,
    // so an over-long header stream is rejected mid-read rather than fully
    // buffered first; the 10s timeout bounds a slow-drip sender.
    tokio::time::timeout(
        Duration::from_secs(10),
        RequestHeader::parse_from_reader(reader, MAX_HEADER_BYTES),
    )
    .await
    .map_err(|_| TunnelError::MalformedRequest("header read timed out".into()))?
}

async fn write_simple<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Result<(), TunnelError> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason);
    let mut has_content_length = false;
    for (k, v) in extra_headers {
        if k.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        out.push_str(&format!("{}: {}\r\n", k, v));
    }
    if !has_content_length {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    Ok(())
}
