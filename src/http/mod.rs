//! HTTP header model, middleware chain, and streaming rewriter (spec §4.3-4.5).

pub mod header;
pub mod middleware;
pub mod rewriter;

pub use header::{HeaderCapable, HeaderMap, RequestHeader, ResponseHeader};
pub use middleware::{MiddlewareChain, RequestMiddleware, ResponseMiddleware, ServerStamp, XForwardedFor};
pub use rewriter::{HttpReadSide, HttpRewriter, HttpWriteSide};
