//! HTTP/1.1 start-line + header-block model (spec §4.3).
//!
//! Two polymorphic entities sharing `{value, set, remove, finalize}` (spec §9
//! "polymorphism via duck-typed interfaces" -> capability sets, not a trait
//! object hierarchy — `RequestHeader` and `ResponseHeader` are plain structs).

use crate::error::TunnelError;

const CRLF: &str = "\r\n";

/// Common header-map operations shared by request and response headers.
pub trait HeaderCapable {
    fn value(&self, key: &str) -> Option<&str>;
    fn set(&mut self, key: &str, value: impl Into<String>);
    fn remove(&mut self, key: &str);
    fn finalize(&self) -> Vec<u8>;
}

/// Ordered header map: insertion order preserved, last write wins on
/// duplicate keys (spec §4.3 — folded/repeated headers out of scope).
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    // (original-case key, value); lookups are case-insensitive.
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|i| self.entries[i].1.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(i) = self.position(key) {
            self.entries[i].1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(i) = self.position(key) {
            self.entries.remove(i);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parse_block(block: &str) -> Self {
        let mut map = Self::default();
        for line in block.split(CRLF) {
            if line.is_empty() {
                continue;
            }
            match line.find(':') {
                Some(0) => { /* empty key, skipped per spec §4.3 */ }
                Some(idx) => {
                    let key = line[..idx].trim();
                    let value = line[idx + 1..].trim();
                    map.set(key, value);
                }
                None => { /* no colon, skipped silently */ }
            }
        }
        map
    }
}

#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub method: String,
    pub path: String,
    pub version: String,
    headers: HeaderMap,
}

impl RequestHeader {
    /// Parse from a fully-captured byte buffer (header block only, no body).
    pub fn parse(buf: &[u8]) -> Result<Self, TunnelError> {
        let text = String::from_utf8_lossy(buf);
        Self::parse_str(&text)
    }

    /// Parse from a buffered reader, reading line-by-line until the blank
    /// separator line (spec §4.3 — the streaming constructor). `max_bytes`
    /// bounds the block as it accumulates, so an unterminated header stream
    /// is rejected during the read instead of after buffering it in full.
    pub async fn parse_from_reader<R>(reader: &mut R, max_bytes: usize) -> Result<Self, TunnelError>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        use tokio::io::AsyncBufReadExt;
        let mut block = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(TunnelError::MalformedRequest("unexpected EOF".into()));
            }
            block.push_str(&line);
            if block.len() > max_bytes {
                return Err(TunnelError::MalformedRequest("header too large".into()));
            }
            if line == CRLF || line == "\n" {
                break;
            }
        }
        Self::parse_str(&block)
    }

    fn parse_str(text: &str) -> Result<Self, TunnelError> {
        let Some(line_end) = text.find(CRLF) else {
            return Err(TunnelError::MalformedRequest(
                "missing CRLF in start line".into(),
            ));
        };
        let start_line = &text[..line_end];
        let rest = &text[line_end + 2..];

        let mut parts = start_line.splitn(3, ' ');
        let method = parts.next().filter(|s| !s.is_empty());
        let path = parts.next().filter(|s| !s.is_empty());
        let version = parts.next().filter(|s| !s.is_empty());
        let (Some(method), Some(path), Some(version)) = (method, path, version) else {
            return Err(TunnelError::MalformedRequest(
                "malformed start line".into(),
            ));
        };

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers: HeaderMap::parse_block(rest),
        })
    }

    pub fn host_slug(&self) -> Option<String> {
        let host = self.value("Host")?;
        let label = host.split('.').next()?;
        if label.is_empty() {
            None
        } else {
            Some(label.to_string())
        }
    }
}

impl HeaderCapable for RequestHeader {
    fn value(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    fn remove(&mut self, key: &str) {
        self.headers.remove(key);
    }

    fn finalize(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}{}", self.method, self.path, self.version, CRLF);
        for (k, v) in self.headers.iter() {
            out.push_str(&format!("{}: {}{}", k, v, CRLF));
        }
        out.push_str(CRLF);
        out.into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub version: String,
    pub status: String,
    pub reason: String,
    headers: HeaderMap,
}

impl ResponseHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, TunnelError> {
        let text = String::from_utf8_lossy(buf);
        Self::parse_str(&text)
    }

    pub async fn parse_from_reader<R>(reader: &mut R) -> Result<Self, TunnelError>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        use tokio::io::AsyncBufReadExt;
        let mut block = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(TunnelError::MalformedRequest("unexpected EOF".into()));
            }
            block.push_str(&line);
            if line == CRLF || line == "\n" {
                break;
            }
        }
        Self::parse_str(&block)
    }

    fn parse_str(text: &str) -> Result<Self, TunnelError> {
        let Some(line_end) = text.find(CRLF) else {
            return Err(TunnelError::MalformedRequest(
                "missing CRLF in start line".into(),
            ));
        };
        let start_line = &text[..line_end];
        let rest = &text[line_end + 2..];

        let mut parts = start_line.splitn(3, ' ');
        let version = parts.next().filter(|s| !s.is_empty());
        let status = parts.next().filter(|s| !s.is_empty());
        let reason = parts.next().unwrap_or("").to_string();
        let (Some(version), Some(status)) = (version, status) else {
            return Err(TunnelError::MalformedRequest(
                "malformed start line".into(),
            ));
        };

        Ok(Self {
            version: version.to_string(),
            status: status.to_string(),
            reason,
            headers: HeaderMap::parse_block(rest),
        })
    }
}

impl HeaderCapable for ResponseHeader {
    fn value(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    fn remove(&mut self, key: &str) {
        self.headers.remove(key);
    }

    fn finalize(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}{}",
            self.version, self.status, self.reason, CRLF
        );
        for (k, v) in self.headers.iter() {
            out.push_str(&format!("{}: {}{}", k, v, CRLF));
        }
        out.push_str(CRLF);
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let raw = b"GET /foo HTTP/1.1\r\nHost: alpha.example.com\r\nX-Test: 1\r\n\r\n";
        let req = RequestHeader::parse(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/foo");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.value("Host"), Some("alpha.example.com"));

        let out = req.finalize();
        let reparsed = RequestHeader::parse(&out).unwrap();
        assert_eq!(reparsed.method, req.method);
        assert_eq!(reparsed.path, req.path);
        assert_eq!(reparsed.value("X-Test"), Some("1"));
    }

    #[test]
    fn missing_crlf_is_malformed() {
        let raw = b"GET /foo HTTP/1.1";
        assert!(matches!(
            RequestHeader::parse(raw),
            Err(TunnelError::MalformedRequest(_))
        ));
    }

    #[test]
    fn missing_parts_is_malformed() {
        let raw = b"GET /foo\r\n\r\n";
        assert!(RequestHeader::parse(raw).is_err());
    }

    #[test]
    fn colon_at_index_zero_yields_empty_key_skipped() {
        let raw = b"GET / HTTP/1.1\r\n: nothing\r\nHost: x\r\n\r\n";
        let req = RequestHeader::parse(raw).unwrap();
        assert_eq!(req.value("Host"), Some("x"));
        assert_eq!(req.headers.iter().count(), 1);
    }

    #[test]
    fn lines_without_colon_are_skipped() {
        let raw = b"GET / HTTP/1.1\r\nnocolonhere\r\nHost: x\r\n\r\n";
        let req = RequestHeader::parse(raw).unwrap();
        assert_eq!(req.value("Host"), Some("x"));
    }

    #[test]
    fn duplicate_keys_collapse_last_write_wins() {
        let raw = b"GET / HTTP/1.1\r\nX: 1\r\nX: 2\r\n\r\n";
        let req = RequestHeader::parse(raw).unwrap();
        assert_eq!(req.value("X"), Some("2"));
    }

    #[test]
    fn host_slug_extracts_first_label() {
        let raw = b"GET / HTTP/1.1\r\nHost: alpha.example.com\r\n\r\n";
        let req = RequestHeader::parse(raw).unwrap();
        assert_eq!(req.host_slug(), Some("alpha".to_string()));
    }

    #[test]
    fn response_round_trip() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let resp = ResponseHeader::parse(raw).unwrap();
        assert_eq!(resp.status, "200");
        assert_eq!(resp.reason, "OK");
        let out = resp.finalize();
        let reparsed = ResponseHeader::parse(&out).unwrap();
        assert_eq!(reparsed.status, resp.status);
    }
}
