//! Error types for the front-end.
//!
//! Errors are scoped: an [`AcceptError`] costs one connection, a
//! [`DirectorError`] or [`ForwardError`] one request. Only
//! [`CredentialError`] is fatal, and only at startup.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to produce a classified connection.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The underlying listener failed to accept.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The peer closed or errored before sending its first byte.
    #[error("first read failed: {0}")]
    FirstRead(#[source] io::Error),

    /// The peer sent nothing within the sniff timeout.
    #[error("no data from peer within {0:?}")]
    SniffTimeout(Duration),

    /// The TLS server handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The TLS server handshake did not complete in time.
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// Failure to load or generate TLS credential material.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A credential file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The certificate file holds no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file holds no supported private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Key or certificate generation failed.
    #[error("failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    /// rustls rejected the certificate/key pair.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failure to rewrite a request's destination.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectorError {
    /// The request carries no connection classification.
    #[error("connection classification missing from request")]
    MissingClassification,

    /// No usable `Host` header.
    #[error("request has no usable Host header")]
    MissingHost,

    /// The rewritten URI did not assemble.
    #[error("invalid outbound URI: {0}")]
    InvalidUri(String),
}

/// Failure to relay a request upstream.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The upstream client could not be built (bad proxy URL, TLS setup).
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),

    /// The outbound URI could not be turned into a URL.
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// The upstream transport failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}
