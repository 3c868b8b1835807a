//! Streaming HTTP detector + header rewriter (spec §4.4, §9).
//!
//! An explicit buffer + delimiter search, not a parser-combinator (spec §9):
//! the read side classifies once, at the start of the ingress stream; the
//! write side re-classifies every time a fresh `HTTP/` line begins a write
//! while its buffer is empty, since HTTP/1.1 keep-alive can pack many
//! responses through the same upstream channel.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;
use crate::http::header::{HeaderCapable, RequestHeader, ResponseHeader};
use crate::http::middleware::MiddlewareChain;

const DELIM: &[u8] = b"\r\n\r\n";
const REQUEST_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

/// Spec §4.4 rule 1+2: classify a buffer starting at offset zero.
pub fn looks_like_http(buf: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(buf) else {
        return false;
    };
    let mut lines = text.split("\r\n");
    let Some(first) = lines.next() else {
        return false;
    };
    if !is_request_line(first) && !is_response_line(first) {
        return false;
    }
    for line in lines {
        if line.is_empty() {
            break;
        }
        match line.find(':') {
            Some(idx) if idx >= 1 => {}
            _ => return false,
        }
    }
    true
}

fn is_request_line(line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let (Some(method), Some(_target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    REQUEST_METHODS.contains(&method) && is_http_version(version)
}

fn is_response_line(line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let (Some(version), Some(code), Some(_reason)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    is_http_version(version) && code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit())
}

fn is_http_version(v: &str) -> bool {
    let Some(rest) = v.strip_prefix("HTTP/") else {
        return false;
    };
    let mut parts = rest.splitn(2, '.');
    let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
        return false;
    };
    major.len() == 1
        && minor.len() == 1
        && major.bytes().all(|b| b.is_ascii_digit())
        && minor.bytes().all(|b| b.is_ascii_digit())
}

fn find_delim(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIM.len()).position(|w| w == DELIM)
}

enum WriteState {
    Buffering(Vec<u8>),
    PassThrough,
}

/// Wraps one ingress connection's reader and writer halves, transparently
/// rewriting HTTP framing in either direction (spec §4.4).
pub struct HttpRewriter<R, W> {
    reader: R,
    writer: W,
    middlewares: Arc<MiddlewareChain>,
    peer_addr: String,
    first_read_done: bool,
    /// Overflow from the first read when the rewritten header didn't fit the
    /// caller's buffer in one call.
    read_overflow: Vec<u8>,
    write_state: WriteState,
}

impl<R, W> HttpRewriter<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, middlewares: Arc<MiddlewareChain>, peer_addr: String) -> Self {
        Self {
            reader,
            writer,
            middlewares,
            peer_addr,
            first_read_done: false,
            read_overflow: Vec::new(),
            write_state: WriteState::PassThrough,
        }
    }

    /// Spec §4.4 reader contract.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, TunnelError> {
        if !self.read_overflow.is_empty() {
            let n = self.read_overflow.len().min(dst.len());
            dst[..n].copy_from_slice(&self.read_overflow[..n]);
            self.read_overflow.drain(..n);
            return Ok(n);
        }

        if self.first_read_done {
            let n = self.reader.read(dst).await?;
            return Ok(n);
        }
        self.first_read_done = true;

        let n = self.reader.read(dst).await?;
        if n == 0 {
            return Ok(0);
        }
        let captured = &dst[..n];

        let Some(delim_at) = find_delim(captured) else {
            return Ok(n);
        };
        let header_block = &captured[..delim_at + DELIM.len()];
        if !looks_like_http(header_block) {
            return Ok(n);
        }

        let body = captured[delim_at + DELIM.len()..].to_vec();
        let mut req = RequestHeader::parse(header_block)?;
        self.middlewares.run_request(&mut req, &self.peer_addr)?;
        let mut rewritten = req.finalize();
        rewritten.extend_from_slice(&body);

        let copy_len = rewritten.len().min(dst.len());
        dst[..copy_len].copy_from_slice(&rewritten[..copy_len]);
        if rewritten.len() > copy_len {
            self.read_overflow = rewritten[copy_len..].to_vec();
        }
        Ok(copy_len)
    }

    /// Spec §4.4 writer contract.
    pub async fn write(&mut self, src: &[u8]) -> Result<usize, TunnelError> {
        let restart = matches!(self.write_state, WriteState::PassThrough)
            && src.starts_with(b"HTTP/");

        if matches!(self.write_state, WriteState::PassThrough) && !restart {
            let res = self.writer.write_all(src).await;
            if let Err(e) = res {
                return Err(e.into());
            }
            return Ok(src.len());
        }

        if restart {
            self.write_state = WriteState::Buffering(Vec::new());
        }

        let WriteState::Buffering(buf) = &mut self.write_state else {
            unreachable!()
        };
        buf.extend_from_slice(src);

        let Some(delim_at) = find_delim(buf) else {
            return Ok(src.len());
        };
        let header_block = buf[..delim_at + DELIM.len()].to_vec();
        let body = buf[delim_at + DELIM.len()..].to_vec();

        if !looks_like_http(&header_block) {
            let flushed = std::mem::take(buf);
            self.write_state = WriteState::PassThrough;
            if let Err(e) = self.writer.write_all(&flushed).await {
                self.clear_write_buffer();
                return Err(e.into());
            }
            return Ok(src.len());
        }

        let result: Result<(), TunnelError> = async {
            let mut resp = ResponseHeader::parse(&header_block)?;
            self.middlewares.run_response(&mut resp)?;
            let mut out = resp.finalize();
            out.extend_from_slice(&body);
            self.writer.write_all(&out).await?;
            Ok(())
        }
        .await;

        self.write_state = WriteState::PassThrough;
        match result {
            Ok(()) => Ok(src.len()),
            Err(e) => {
                self.clear_write_buffer();
                Err(e)
            }
        }
    }

    fn clear_write_buffer(&mut self) {
        self.write_state = WriteState::PassThrough;
    }

    /// Idempotent close. Half-closes the writer (write shutdown only) when
    /// the underlying type supports it; callers that need the socket fully
    /// torn down drop the `HttpRewriter` afterwards.
    pub async fn close_write(&mut self) -> Result<(), TunnelError> {
        self.writer.shutdown().await.map_err(Into::into)
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    /// Skips the one-time request classification on the read side. Used by
    /// the HTTP ingress router, which already parsed and forwarded the
    /// initial request itself (spec §4.6 step 6) before handing the rest of
    /// the connection to the rewriter.
    pub fn without_initial_classification(mut self) -> Self {
        self.first_read_done = true;
        self
    }

    /// Splits into independently-drivable read/write halves so a splice can
    /// run both directions concurrently — `read()` and `write()` touch
    /// disjoint state (spec §4.4 treats them as separate contracts).
    pub fn split(self) -> (HttpReadSide<R>, HttpWriteSide<W>) {
        (
            HttpReadSide {
                reader: self.reader,
                middlewares: self.middlewares.clone(),
                peer_addr: self.peer_addr,
                first_read_done: self.first_read_done,
                read_overflow: self.read_overflow,
            },
            HttpWriteSide {
                writer: self.writer,
                middlewares: self.middlewares,
                write_state: self.write_state,
            },
        )
    }
}

/// The request-rewriting half of an [`HttpRewriter`].
pub struct HttpReadSide<R> {
    reader: R,
    middlewares: Arc<MiddlewareChain>,
    peer_addr: String,
    first_read_done: bool,
    read_overflow: Vec<u8>,
}

impl<R: AsyncRead + Unpin> HttpReadSide<R> {
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, TunnelError> {
        if !self.read_overflow.is_empty() {
            let n = self.read_overflow.len().min(dst.len());
            dst[..n].copy_from_slice(&self.read_overflow[..n]);
            self.read_overflow.drain(..n);
            return Ok(n);
        }

        if self.first_read_done {
            let n = self.reader.read(dst).await?;
            return Ok(n);
        }
        self.first_read_done = true;

        let n = self.reader.read(dst).await?;
        if n == 0 {
            return Ok(0);
        }
        let captured = &dst[..n];

        let Some(delim_at) = find_delim(captured) else {
            return Ok(n);
        };
        let header_block = &captured[..delim_at + DELIM.len()];
        if !looks_like_http(header_block) {
            return Ok(n);
        }

        let body = captured[delim_at + DELIM.len()..].to_vec();
        let mut req = RequestHeader::parse(header_block)?;
        self.middlewares.run_request(&mut req, &self.peer_addr)?;
        let mut rewritten = req.finalize();
        rewritten.extend_from_slice(&body);

        let copy_len = rewritten.len().min(dst.len());
        dst[..copy_len].copy_from_slice(&rewritten[..copy_len]);
        if rewritten.len() > copy_len {
            self.read_overflow = rewritten[copy_len..].to_vec();
        }
        Ok(copy_len)
    }
}

/// The response-rewriting half of an [`HttpRewriter`].
pub struct HttpWriteSide<W> {
    writer: W,
    middlewares: Arc<MiddlewareChain>,
    write_state: WriteState,
}

impl<W: AsyncWrite + Unpin> HttpWriteSide<W> {
    pub async fn write(&mut self, src: &[u8]) -> Result<usize, TunnelError> {
        let restart = matches!(self.write_state, WriteState::PassThrough)
            && src.starts_with(b"HTTP/");

        if matches!(self.write_state, WriteState::PassThrough) && !restart {
            self.writer.write_all(src).await?;
            return Ok(src.len());
        }

        if restart {
            self.write_state = WriteState::Buffering(Vec::new());
        }

        let WriteState::Buffering(buf) = &mut self.write_state else {
            unreachable!()
        };
        buf.extend_from_slice(src);

        let Some(delim_at) = find_delim(buf) else {
            return Ok(src.len());
        };
        let header_block = buf[..delim_at + DELIM.len()].to_vec();
        let body = buf[delim_at + DELIM.len()..].to_vec();

        if !looks_like_http(&header_block) {
            let flushed = std::mem::take(buf);
            self.write_state = WriteState::PassThrough;
            self.writer.write_all(&flushed).await?;
            return Ok(src.len());
        }

        let result: Result<(), TunnelError> = async {
            let mut resp = ResponseHeader::parse(&header_block)?;
            self.middlewares.run_response(&mut resp)?;
            let mut out = resp.finalize();
            out.extend_from_slice(&body);
            self.writer.write_all(&out).await?;
            Ok(())
        }
        .await;

        self.write_state = WriteState::PassThrough;
        result.map(|()| src.len())
    }

    pub async fn close_write(&mut self) -> Result<(), TunnelError> {
        self.writer.shutdown().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::middleware::MiddlewareChain;
    use std::io::Cursor;

    fn chain() -> Arc<MiddlewareChain> {
        Arc::new(MiddlewareChain::standard())
    }

    #[test]
    fn classifies_request_and_response_lines() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"));
        assert!(looks_like_http(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"));
        assert!(!looks_like_http(b"not http at all\r\n\r\n"));
    }

    #[test]
    fn rejects_header_line_without_colon() {
        assert!(!looks_like_http(b"GET / HTTP/1.1\r\nbadline\r\n\r\n"));
    }

    #[tokio::test]
    async fn read_identity_on_non_http_prefix() {
        let data = b"just raw bytes, no CRLFCRLF anywhere".to_vec();
        let reader = Cursor::new(data.clone());
        let writer = Vec::new();
        let mut rw = HttpRewriter::new(reader, writer, chain(), "1.2.3.4:1".into());
        let mut dst = vec![0u8; 128];
        let n = rw.read(&mut dst).await.unwrap();
        assert_eq!(&dst[..n], &data[..n]);
    }

    #[tokio::test]
    async fn read_rewrites_request_header() {
        let data = b"GET /x HTTP/1.1\r\nHost: alpha.example.com\r\n\r\nBODY".to_vec();
        let reader = Cursor::new(data);
        let writer = Vec::new();
        let mut rw = HttpRewriter::new(reader, writer, chain(), "9.9.9.9:4000".into());
        let mut dst = vec![0u8; 4096];
        let n = rw.read(&mut dst).await.unwrap();
        let out = String::from_utf8_lossy(&dst[..n]).to_string();
        assert!(out.contains("X-Forwarded-For: 9.9.9.9"));
        assert!(out.ends_with("BODY"));
    }

    #[tokio::test]
    async fn write_buffers_split_response_across_calls() {
        let reader = Cursor::new(Vec::new());
        let writer: Vec<u8> = Vec::new();
        let mut rw = HttpRewriter::new(reader, writer, chain(), "1.1.1.1:1".into());
        rw.write(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        rw.write(b"Content-Length: 5\r\n\r\n").await.unwrap();
        rw.write(b"hello").await.unwrap();
        let (_, out) = rw.into_inner();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Server: Tunnel Please"));
        assert!(text.ends_with("hello"));
    }

    #[tokio::test]
    async fn write_identity_on_non_crlfcrlf_stream() {
        let reader = Cursor::new(Vec::new());
        let writer: Vec<u8> = Vec::new();
        let mut rw = HttpRewriter::new(reader, writer, chain(), "1.1.1.1:1".into());
        rw.write(b"no delimiter here").await.unwrap();
        let (_, out) = rw.into_inner();
        assert_eq!(out, b"no delimiter here");
    }
}
