//! Outbound destination rewriting.
//!
//! The destination is entirely request-driven: the host comes from an
//! absolute-form request target or else the request's own `Host` header,
//! and the scheme from how the connection
//! arrived (TLS => `https`, plaintext => `http`).

use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::Uri;
use tracing::error;

use super::listener::ConnectionInfo;
use crate::error::DirectorError;

/// Rewrites each request's URI before it is forwarded.
#[derive(Debug, Default, Clone)]
pub struct Director;

impl Director {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite `parts.uri` to `<scheme>://<Host><path?query>`.
    ///
    /// Only the URI is modified. On error the URI is left untouched.
    pub fn direct(&self, parts: &mut Parts) -> Result<(), DirectorError> {
        let Some(info) = parts.extensions.get::<ConnectionInfo>() else {
            error!(
                uri = %parts.uri,
                "BUG: request has no connection classification, rewrite abandoned"
            );
            return Err(DirectorError::MissingClassification);
        };
        let scheme = info.classification().scheme();

        let authority = request_authority(parts)?;
        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| DirectorError::InvalidUri(e.to_string()))?;

        parts.uri = uri;
        Ok(())
    }
}

/// The authority of an absolute-form request target, falling back to the
/// `Host` header.
fn request_authority(parts: &Parts) -> Result<Authority, DirectorError> {
    if let Some(authority) = parts.uri.authority() {
        return Ok(authority.clone());
    }

    parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .ok_or(DirectorError::MissingHost)?
        .parse()
        .map_err(|_| DirectorError::MissingHost)
}
