//! Request/response middleware chain (spec §4.5).
//!
//! Middlewares run in insertion order; the first error aborts the chain and
//! propagates (spec §4.11 "middleware errors abort the current request and
//! close the stream").

use crate::error::TunnelError;
use crate::http::header::{HeaderCapable, RequestHeader, ResponseHeader};

/// Fixed product identity stamped onto every response (spec §8 scenario 1).
pub const SERVER_IDENTITY: &str = "Tunnel Please";

pub trait RequestMiddleware: Send + Sync {
    fn apply(&self, req: &mut RequestHeader, peer_addr: &str) -> Result<(), TunnelError>;
}

pub trait ResponseMiddleware: Send + Sync {
    fn apply(&self, resp: &mut ResponseHeader) -> Result<(), TunnelError>;
}

/// Injects `X-Forwarded-For` from the ingress peer address, overwriting any
/// value already present.
pub struct XForwardedFor;

impl RequestMiddleware for XForwardedFor {
    fn apply(&self, req: &mut RequestHeader, peer_addr: &str) -> Result<(), TunnelError> {
        let host = host_of(peer_addr)?;
        req.set("X-Forwarded-For", host);
        Ok(())
    }
}

/// Extract the host component of a `host:port` address. IPv6 literals are
/// expected bracketed (`[::1]:8080`), matching `SocketAddr::to_string()`.
fn host_of(addr: &str) -> Result<String, TunnelError> {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return Ok(rest[..end].to_string());
        }
        return Err(TunnelError::MalformedAddr(addr.to_string()));
    }
    match addr.rfind(':') {
        Some(idx) if idx > 0 => Ok(addr[..idx].to_string()),
        _ => Err(TunnelError::MalformedAddr(addr.to_string())),
    }
}

/// Stamps a fixed `Server` header onto every response.
pub struct ServerStamp;

impl ResponseMiddleware for ServerStamp {
    fn apply(&self, resp: &mut ResponseHeader) -> Result<(), TunnelError> {
        resp.set("Server", SERVER_IDENTITY);
        Ok(())
    }
}

/// Ordered set of middlewares applied to one ingress-to-upstream pairing.
#[derive(Default)]
pub struct MiddlewareChain {
    request: Vec<Box<dyn RequestMiddleware>>,
    response: Vec<Box<dyn ResponseMiddleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, m: impl RequestMiddleware + 'static) -> Self {
        self.request.push(Box::new(m));
        self
    }

    pub fn with_response(mut self, m: impl ResponseMiddleware + 'static) -> Self {
        self.response.push(Box::new(m));
        self
    }

    /// Default chain used by every HTTP/HTTPS ingress pairing (spec §4.6 step 6).
    pub fn standard() -> Self {
        Self::new()
            .with_request(XForwardedFor)
            .with_response(ServerStamp)
    }

    pub fn run_request(&self, req: &mut RequestHeader, peer_addr: &str) -> Result<(), TunnelError> {
        for m in &self.request {
            m.apply(req, peer_addr)?;
        }
        Ok(())
    }

    pub fn run_response(&self, resp: &mut ResponseHeader) -> Result<(), TunnelError> {
        for m in &self.response {
            m.apply(resp)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::RequestHeader;

    #[test]
    fn xff_injection_overwrites_prior_value() {
        let mut req =
            RequestHeader::parse(b"GET / HTTP/1.1\r\nX-Forwarded-For: old\r\n\r\n").unwrap();
        XForwardedFor.apply(&mut req, "203.0.113.5:54321").unwrap();
        assert_eq!(req.value("X-Forwarded-For"), Some("203.0.113.5"));
    }

    #[test]
    fn xff_rejects_non_host_port_address() {
        let mut req = RequestHeader::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let err = XForwardedFor.apply(&mut req, "not-an-address").unwrap_err();
        assert!(matches!(err, TunnelError::MalformedAddr(_)));
    }

    #[test]
    fn ipv6_host_extraction() {
        assert_eq!(host_of("[::1]:443").unwrap(), "::1");
    }

    #[test]
    fn server_stamp_sets_fixed_identity() {
        use crate::http::header::ResponseHeader;
        let mut resp = ResponseHeader::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        ServerStamp.apply(&mut resp).unwrap();
        assert_eq!(resp.value("Server"), Some(SERVER_IDENTITY));
    }

    #[test]
    fn chain_aborts_on_first_error() {
        struct AlwaysFails;
        impl RequestMiddleware for AlwaysFails {
            fn apply(&self, _req: &mut RequestHeader, _peer: &str) -> Result<(), TunnelError> {
                Err(TunnelError::MiddlewareFailed("boom".into()))
            }
        }
        let chain = MiddlewareChain::new()
            .with_request(AlwaysFails)
            .with_request(XForwardedFor);
        let mut req = RequestHeader::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(chain.run_request(&mut req, "1.2.3.4:80").is_err());
    }
}
