//! Protocol-sniffing HTTP front-end.
//!
//! This module provides:
//! - Unix socket listener management
//! - First-byte protocol classification (TLS vs plaintext)
//! - TLS termination with locally held credentials
//! - Scheme-recovering request direction by `Host` header
//! - Request forwarding over a pooled upstream transport
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Sniffer -> [TLS handshake] -> HTTP/1.1 -> Director -> Upstream
//!                          |                                          ^
//!                          +------------ ConnectionInfo --------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Director, ForwardingEngine, HttpUpstream, Listener, ListenerConfig, TransportConfig};
//!
//! let upstream = Arc::new(HttpUpstream::new(&TransportConfig::default())?);
//! let engine = Arc::new(ForwardingEngine::new(Director::new(), upstream));
//!
//! let config = ListenerConfig::new("/tmp/frontdoor.sock");
//! let listener = Listener::bind(config, tls_config, engine).await?;
//! Arc::new(listener).run().await?;
//! ```

mod director;
mod forward;
mod listener;
mod peek;
mod sniff;

pub use director::Director;
pub use forward::{
    remove_hop_by_hop, status_response, BoxError, ForwardStats, ForwardingEngine, HttpUpstream,
    ProxyBody, TransportConfig, Upstream,
};
pub use listener::{
    ClassifiedStream, Classifier, ConnectionInfo, Listener, ListenerConfig, ListenerStats,
    PendingConnection, DEFAULT_BIND_PATH,
};
pub use peek::PeekedStream;
pub use sniff::{
    AddressError, Classification, ProtocolSniffer, SniffState, SyntheticAddress,
    TLS_HANDSHAKE_RECORD,
};
