//! Core type aliases used throughout the proxy.
//!
//! These standardize the request/response/error types so the rest of the
//! crate doesn't need to spell out Hyper's generic parameters.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;

use crate::body::ProxyBody;

/// HTTP request body, boxed so the router doesn't depend on whether it came
/// from a live connection ([`hyper::body::Incoming`]) or a test fixture.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// HTTP request with a boxed streaming body.
pub type Request = hyper::Request<RequestBody>;

/// HTTP response using [`ProxyBody`] for the body.
pub type Response = hyper::Response<ProxyBody>;

/// Boxed HTTP body used internally by [`ProxyBody`].
pub(crate) type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe dynamic dispatch.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
