//! Unix socket listener with per-connection protocol classification.
//!
//! Every accepted connection is sniffed before anything else reads from it:
//! - first byte `0x16`: TLS, terminated here with the configured credentials
//! - anything else: plaintext HTTP
//!
//! The sniffed bytes are replayed through [`PeekedStream`], so the TLS
//! handshake or HTTP parser sees the stream from its very first byte. The
//! resulting [`ClassifiedStream`] carries a [`ConnectionInfo`] that the
//! director later reads to pick the outbound scheme.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::forward::ForwardingEngine;
use super::peek::PeekedStream;
use super::sniff::{Classification, ProtocolSniffer, SniffState, SyntheticAddress};
use crate::error::AcceptError;

/// Default bind path for the listening socket.
pub const DEFAULT_BIND_PATH: &str = "/tmp/frontdoor.sock";

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for the peer's first byte.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for the TLS server handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a request's headers to arrive.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Filesystem path of the Unix socket.
    pub bind_path: PathBuf,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for the first byte.
    pub sniff_timeout: Duration,
    /// Time allowed for the TLS handshake.
    pub handshake_timeout: Duration,
    /// Time allowed for HTTP request headers.
    pub header_read_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_path: bind_path.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being served.
    pub connections_active: AtomicU64,
    /// Connections finished.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections classified as TLS and handshaken.
    pub classified_tls: AtomicU64,
    /// Connections classified as plaintext.
    pub classified_plaintext: AtomicU64,
    /// First-byte reads that failed or timed out.
    pub sniff_failed: AtomicU64,
    /// TLS handshakes that failed or timed out.
    pub handshake_failed: AtomicU64,
}

/// Per-connection attribute recording how the connection arrived.
///
/// Inserted into the extensions of every request served on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    local_addr: SyntheticAddress,
}

impl ConnectionInfo {
    pub fn new(classification: Classification, bind_path: impl AsRef<Path>) -> Self {
        Self {
            local_addr: SyntheticAddress::new(classification, bind_path),
        }
    }

    pub fn classification(&self) -> Classification {
        self.local_addr.classification()
    }

    /// The synthetic local address, `<scheme>:<bind path>`.
    pub fn local_addr(&self) -> &SyntheticAddress {
        &self.local_addr
    }
}

enum Transport<S> {
    Plain(PeekedStream<S>),
    Tls(Box<TlsStream<PeekedStream<S>>>),
}

/// A connection after classification, ready for HTTP parsing.
pub struct ClassifiedStream<S> {
    transport: Transport<S>,
    info: ConnectionInfo,
}

impl<S> ClassifiedStream<S> {
    pub fn classification(&self) -> Classification {
        self.info.classification()
    }

    /// Reported local address. Fixed for the lifetime of the connection.
    pub fn local_addr(&self) -> &SyntheticAddress {
        self.info.local_addr()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClassifiedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ClassifiedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Sniffs raw streams and terminates TLS where needed.
#[derive(Clone)]
pub struct Classifier {
    acceptor: TlsAcceptor,
    bind_path: PathBuf,
    sniff_timeout: Duration,
    handshake_timeout: Duration,
}

impl Classifier {
    pub fn new(config: &ListenerConfig, tls_config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls_config),
            bind_path: config.bind_path.clone(),
            sniff_timeout: config.sniff_timeout,
            handshake_timeout: config.handshake_timeout,
        }
    }

    /// Classify `stream` and, for TLS, complete the server handshake.
    pub async fn classify<S>(&self, mut stream: S) -> Result<ClassifiedStream<S>, AcceptError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (classification, sniffed) = match timeout(self.sniff_timeout, sniff(&mut stream)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(AcceptError::FirstRead(e)),
            Err(_) => return Err(AcceptError::SniffTimeout(self.sniff_timeout)),
        };

        let peeked = PeekedStream::new(stream, sniffed);
        let transport = match classification {
            Classification::Tls => {
                let handshake = self.acceptor.accept(peeked);
                match timeout(self.handshake_timeout, handshake).await {
                    Ok(Ok(tls)) => Transport::Tls(Box::new(tls)),
                    Ok(Err(e)) => return Err(AcceptError::Handshake(e)),
                    Err(_) => return Err(AcceptError::HandshakeTimeout(self.handshake_timeout)),
                }
            }
            Classification::Plaintext => Transport::Plain(peeked),
        };

        Ok(ClassifiedStream {
            transport,
            info: ConnectionInfo::new(classification, &self.bind_path),
        })
    }
}

/// Read just enough bytes for the sniffer to decide.
///
/// Reads one byte at a time so nothing past the decision point is consumed.
async fn sniff<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(Classification, Vec<u8>)> {
    let mut sniffer = ProtocolSniffer::new();
    let mut sniffed = Vec::with_capacity(super::sniff::MAX_SNIFF_BYTES);

    loop {
        if let SniffState::Done(classification) = sniffer.state() {
            return Ok((classification, sniffed));
        }

        let mut byte = [0u8; 1];
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before first byte",
            ));
        }
        sniffed.push(byte[0]);
        sniffer.feed(&byte);
    }
}

/// An accepted connection that has not been classified yet.
pub struct PendingConnection {
    stream: UnixStream,
    classifier: Classifier,
}

impl PendingConnection {
    pub async fn classify(self) -> Result<ClassifiedStream<UnixStream>, AcceptError> {
        self.classifier.classify(self.stream).await
    }
}

/// The front-end listener.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The Unix socket listener.
    listener: UnixListener,
    /// Sniffing and TLS termination.
    classifier: Classifier,
    /// Serves HTTP on classified connections.
    engine: Arc<ForwardingEngine>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket, replacing whatever exists at the path.
    pub async fn bind(
        config: ListenerConfig,
        tls_config: Arc<ServerConfig>,
        engine: Arc<ForwardingEngine>,
    ) -> io::Result<Self> {
        match std::fs::remove_file(&config.bind_path) {
            Ok(()) => debug!(bind_path = %config.bind_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&config.bind_path)?;

        info!(
            bind_path = %config.bind_path.display(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            classifier: Classifier::new(&config, tls_config),
            listener,
            config,
            engine,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Path this listener is bound to.
    pub fn bind_path(&self) -> &Path {
        &self.config.bind_path
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept the next connection without classifying it.
    pub async fn accept_raw(&self) -> Result<PendingConnection, AcceptError> {
        let (stream, _) = self.listener.accept().await.map_err(AcceptError::Accept)?;
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        Ok(PendingConnection {
            stream,
            classifier: self.classifier.clone(),
        })
    }

    /// Accept and classify the next connection.
    ///
    /// Errors are scoped to this attempt; the listener stays usable.
    pub async fn accept(&self) -> Result<ClassifiedStream<UnixStream>, AcceptError> {
        let pending = self.accept_raw().await?;
        let result = pending.classify().await;
        self.record_classification(&result);
        result
    }

    fn record_classification<S>(&self, result: &Result<ClassifiedStream<S>, AcceptError>) {
        let counter = match result {
            Ok(stream) => match stream.classification() {
                Classification::Tls => &self.stats.classified_tls,
                Classification::Plaintext => &self.stats.classified_plaintext,
            },
            Err(AcceptError::Handshake(_) | AcceptError::HandshakeTimeout(_)) => {
                &self.stats.handshake_failed
            }
            Err(AcceptError::FirstRead(_) | AcceptError::SniffTimeout(_)) => {
                &self.stats.sniff_failed
            }
            Err(AcceptError::Accept(_)) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Run the accept loop forever.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the accept loop until `shutdown` resolves.
    ///
    /// Connections already accepted keep running and drain on their own.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(bind_path = %self.config.bind_path.display(), "Listener started");

        loop {
            let pending = tokio::select! {
                _ = &mut shutdown => {
                    info!(bind_path = %self.config.bind_path.display(), "Listener stopped");
                    return Ok(());
                }
                pending = self.accept_raw() => pending,
            };

            let pending = match pending {
                Ok(pending) => pending,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats
                        .connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("Connection rejected: max connections reached");
                    continue;
                }
            };

            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let conn_id = self.stats.connections_accepted.load(Ordering::Relaxed);
            let listener = Arc::clone(&self);

            tokio::spawn(
                async move {
                    listener.handle_connection(pending).await;

                    listener
                        .stats
                        .connections_active
                        .fetch_sub(1, Ordering::Relaxed);
                    listener
                        .stats
                        .connections_closed
                        .fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", id = conn_id)),
            );
        }
    }

    /// Classify one connection and serve HTTP on it.
    async fn handle_connection(&self, pending: PendingConnection) {
        let result = pending.classify().await;
        self.record_classification(&result);

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "Connection dropped before HTTP");
                return;
            }
        };

        debug!(local_addr = %stream.local_addr(), "Connection classified");

        if let Err(e) = Arc::clone(&self.engine)
            .serve_connection(stream, self.config.header_read_timeout)
            .await
        {
            debug!(error = %e, "Connection error");
        }
    }
}
