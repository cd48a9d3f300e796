//! # Switchboard
//!
//! TLS listener and dialer: accepts peer connections, deframes inbound
//! messages onto the queue fabric, and delivers outbound messages with
//! retry and exponential backoff.
//!
//! ## Inbound
//!
//! Accepted connections pass a pluggable blocked-peer predicate, complete
//! the TLS handshake and get a reader task. Each deframed message has its
//! capability advertisement recorded (a bare hash resolves against the
//! capability cache, answering `CapHashNotKnown` when it cannot), then
//! every section is classified and enqueued. A full queue answers the
//! sender with `UnspecServerErr`. Oversized frames are answered with
//! `MsgTooLarge` and the stream is closed; merely malformed payloads get
//! `BadMessage` and the stream survives.
//!
//! ## Outbound
//!
//! `send_to` reuses pooled streams, dialing when the pool is empty. The
//! first message on a fresh outgoing connection carries this server's
//! capability hash in place of the full list. A failed write closes that
//! stream and tries the next; when none remain the call sleeps, doubles
//! its backoff and retries until the retry budget is spent, then reports
//! the peer unreachable.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::cache::{Caches, ConnHandle};
use crate::engine::Outbound;
use crate::message::{Capability, Message, NotificationKind, Peer, Token};
use crate::queue::{QueueFabric, WorkItem};
use crate::wire::{self, WireError};

/// Retry budget used for engine-driven sends.
const SEND_RETRIES: usize = 2;

/// Initial backoff for engine-driven sends, doubled per retry.
const SEND_BACKOFF_MS: u64 = 100;

// ============================================================================
// Blocked-Peer Predicate
// ============================================================================

/// Pluggable peer admission predicate, consulted before the TLS handshake.
pub trait IsBlocked: Send + Sync {
    fn is_blocked(&self, peer: &Peer) -> bool;
}

/// Default policy: nobody is blocked.
pub struct NeverBlocked;

impl IsBlocked for NeverBlocked {
    fn is_blocked(&self, _peer: &Peer) -> bool {
        false
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for outbound delivery.
#[derive(Debug)]
pub enum SendError {
    /// Every connection attempt and retry failed.
    Unreachable { peer: Peer, attempts: usize },
    /// The message cannot be encoded within the size limit.
    TooLarge,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Unreachable { peer, attempts } => {
                write!(f, "peer {peer} unreachable after {attempts} attempts")
            }
            SendError::TooLarge => write!(f, "message exceeds the frame size limit"),
        }
    }
}

impl std::error::Error for SendError {}

// ============================================================================
// Switchboard
// ============================================================================

pub struct Switchboard {
    caches: Arc<Caches>,
    fabric: QueueFabric,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    blocked: Arc<dyn IsBlocked>,
    msg_max_size: usize,
    tcp_timeout: Duration,
    capability_hash: String,
    capabilities: Vec<Capability>,
}

impl Switchboard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        caches: Arc<Caches>,
        fabric: QueueFabric,
        acceptor: TlsAcceptor,
        connector: TlsConnector,
        blocked: Arc<dyn IsBlocked>,
        msg_max_size: usize,
        tcp_timeout: Duration,
        capabilities: Vec<Capability>,
    ) -> Self {
        let capability_hash = crate::message::capability_hash(&capabilities);
        Switchboard {
            caches,
            fabric,
            acceptor,
            connector,
            blocked,
            msg_max_size,
            tcp_timeout,
            capability_hash,
            capabilities,
        }
    }

    /// This server's capability hash, advertised on fresh connections.
    pub fn capability_hash(&self) -> &str {
        &self.capability_hash
    }

    // ------------------------------------------------------------------
    // Listening
    // ------------------------------------------------------------------

    /// Accept loop. Each connection is checked against the blocked-peer
    /// predicate, TLS-accepted and handed to a reader task. Returns when
    /// `shutdown` fires.
    pub async fn listen(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        info!(addr = ?listener.local_addr().ok(), "listening");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let peer = Peer::tcp(addr);
            if self.blocked.is_blocked(&peer) {
                debug!(%peer, "rejecting blocked peer");
                continue;
            }
            let switchboard = self.clone();
            tokio::spawn(async move {
                match switchboard.acceptor.accept(stream).await {
                    Ok(tls) => {
                        switchboard.register(tokio_rustls::TlsStream::Server(tls), peer);
                    }
                    Err(e) => debug!(%peer, error = %e, "TLS accept failed"),
                }
            });
        }
        info!("listener stopped");
    }

    /// Register an established stream: pool its writer half and spawn the
    /// reader task for its inbound frames.
    fn register(self: &Arc<Self>, stream: tokio_rustls::TlsStream<TcpStream>, peer: Peer) -> ConnHandle {
        let (read_half, write_half) = tokio::io::split(stream);
        let handle = self.caches.connections.add(peer, write_half);
        let switchboard = self.clone();
        let reader_handle = handle.clone();
        tokio::spawn(async move {
            switchboard.read_loop(read_half, peer, reader_handle).await;
        });
        handle
    }

    /// Deframe inbound messages until the stream dies, delivering each
    /// into the pipeline and writing immediate replies back on the same
    /// stream.
    async fn read_loop<R>(self: Arc<Self>, mut read_half: R, peer: Peer, handle: ConnHandle)
    where
        R: tokio::io::AsyncRead + Send + Unpin,
    {
        loop {
            match wire::read_message(&mut read_half, self.msg_max_size).await {
                Ok(message) => {
                    let replies = self.deliver(message, peer);
                    for reply in replies {
                        if self.write_on(&handle, &reply).await.is_err() {
                            self.caches.connections.remove(&peer, handle.id);
                            return;
                        }
                    }
                }
                Err(WireError::TooLarge { size, limit }) => {
                    warn!(%peer, size, limit, "oversized frame, closing stream");
                    let notification = Message::notification(
                        Token::default(),
                        NotificationKind::MsgTooLarge,
                        format!("{size} > {limit}"),
                    );
                    let _ = self.write_on(&handle, &notification).await;
                    break;
                }
                Err(WireError::Malformed(detail)) => {
                    debug!(%peer, %detail, "malformed message");
                    let notification = Message::notification(
                        Token::default(),
                        NotificationKind::BadMessage,
                        detail,
                    );
                    if self.write_on(&handle, &notification).await.is_err() {
                        break;
                    }
                }
                Err(WireError::Closed) => {
                    debug!(%peer, "stream closed");
                    break;
                }
                Err(WireError::Io(e)) => {
                    debug!(%peer, error = %e, "stream failed");
                    break;
                }
            }
        }
        self.caches.connections.remove(&peer, handle.id);
    }

    /// Record capability advertisements and enqueue each section of the
    /// message. Returns the replies to write back immediately.
    fn deliver(&self, message: Message, peer: Peer) -> Vec<Message> {
        let mut replies = Vec::new();
        self.record_capabilities(&message, peer, &mut replies);
        for section in message.content {
            let zone_known = match (section.subject_zone(), section.context()) {
                (Some(zone), Some(context)) => self.caches.zone_keys.contains_zone(zone, context),
                _ => false,
            };
            let class = QueueFabric::classify(&section, zone_known);
            let item = WorkItem {
                section,
                sender: peer,
                token: message.token,
            };
            if self.fabric.enqueue(class, item).is_err() {
                warn!(%peer, ?class, "queue full");
                replies.push(Message::notification(
                    message.token,
                    NotificationKind::UnspecServerErr,
                    "queue full",
                ));
            }
        }
        replies
    }

    /// A single 64-hex capability entry is a hash standing in for a list
    /// advertised earlier; anything else is a full list.
    fn record_capabilities(&self, message: &Message, peer: Peer, replies: &mut Vec<Message>) {
        match message.capabilities.as_slice() {
            [] => {}
            [hash] if looks_like_hash(hash.as_str()) => {
                if !self.caches.capabilities.add_by_hash(peer, hash.as_str()) {
                    debug!(%peer, "unknown capability hash");
                    replies.push(Message::notification(
                        message.token,
                        NotificationKind::CapHashNotKnown,
                        self.capability_list_string(),
                    ));
                }
            }
            list => {
                self.caches.capabilities.add(peer, list.to_vec());
            }
        }
    }

    fn capability_list_string(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Deliver `message` to `peer`, dialing if no pooled connection
    /// exists. On write failure the stream is closed and the next one
    /// tried; exhausted pools sleep `backoff_ms` (doubling each round)
    /// until `retries` rounds have failed.
    pub async fn send_to(
        self: &Arc<Self>,
        peer: Peer,
        message: Message,
        mut retries: usize,
        mut backoff_ms: u64,
    ) -> Result<(), SendError> {
        let mut message = message;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut handles = self.caches.connections.get(&peer);
            if handles.is_empty() {
                match self.dial(peer).await {
                    Ok(handle) => {
                        // First message on a fresh connection advertises
                        // our capability hash.
                        message.capabilities = vec![Capability(self.capability_hash.clone())];
                        handles = vec![handle];
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "dial failed");
                        handles = Vec::new();
                    }
                }
            }
            for handle in handles {
                match self.write_on(&handle, &message).await {
                    Ok(()) => return Ok(()),
                    Err(WireError::TooLarge { .. }) => return Err(SendError::TooLarge),
                    Err(e) => {
                        debug!(%peer, error = %e, "write failed, closing stream");
                        self.caches.connections.remove(&peer, handle.id);
                    }
                }
            }
            if retries == 0 {
                warn!(%peer, attempts, "unreachable, no retries left");
                return Err(SendError::Unreachable { peer, attempts });
            }
            retries -= 1;
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(2);
        }
    }

    /// Dial `peer`, complete the TLS handshake and register the stream.
    async fn dial(self: &Arc<Self>, peer: Peer) -> Result<ConnHandle, anyhow::Error> {
        use anyhow::Context as _;

        let addr = peer.socket_addr();
        let tcp = tokio::time::timeout(self.tcp_timeout, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .context("connect failed")?;
        let server_name = rustls::pki_types::ServerName::from(addr.ip());
        let tls = tokio::time::timeout(self.tcp_timeout, self.connector.connect(server_name, tcp))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;
        Ok(self.register(tokio_rustls::TlsStream::Client(tls), peer))
    }

    /// Write one framed message on a pooled stream, under the write
    /// deadline. The stream lock is per-connection, not a cache lock.
    async fn write_on(&self, handle: &ConnHandle, message: &Message) -> Result<(), WireError> {
        let mut writer = handle.writer.lock().await;
        match tokio::time::timeout(
            self.tcp_timeout,
            wire::write_message(&mut *writer, message, self.msg_max_size),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write deadline exceeded",
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Background pumps
    // ------------------------------------------------------------------

    /// Drain engine replies to their destinations.
    pub async fn run_outbound(
        self: Arc<Self>,
        mut out_rx: mpsc::Receiver<Outbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let outbound = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                outbound = out_rx.recv() => outbound,
            };
            let Some(Outbound { peer, message }) = outbound else { break };
            if let Err(e) = self.send_to(peer, message, SEND_RETRIES, SEND_BACKOFF_MS).await {
                warn!(%peer, error = %e, "failed to deliver reply");
            }
        }
        info!("outbound pump stopped");
    }

    /// Periodic heartbeat notifications on every pooled connection.
    pub async fn run_keepalive(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            for peer in self.caches.connections.peers() {
                let heartbeat =
                    Message::notification(Token::fresh(), NotificationKind::Heartbeat, "");
                if self.send_to(peer, heartbeat, 0, 0).await.is_err() {
                    debug!(%peer, "dropping unresponsive connection");
                    self.caches.connections.remove_peer(&peer);
                }
            }
        }
    }
}

fn looks_like_hash(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

// ============================================================================
// Permissive Certificate Verifier
// ============================================================================

/// Server-certificate verifier that accepts any certificate. Peers
/// authorize each other by signature chain, not by TLS certificate, so
/// testing configurations may skip certificate verification entirely.
/// Production configurations pin roots instead.
#[derive(Debug)]
pub struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{
        AssertionCache, CacheBounds, CapabilityCache, ConnectionCache, NegAssertionCache,
        PendingKeyCache, PendingQueryCache, ZoneKeyCache,
    };
    use crate::queue::QueueConfig;
    use std::net::SocketAddr;

    fn test_caches() -> Arc<Caches> {
        Arc::new(Caches {
            zone_keys: ZoneKeyCache::new(CacheBounds::new(100, 80), 10),
            assertions: AssertionCache::new(CacheBounds::new(100, 80)),
            negatives: NegAssertionCache::new(CacheBounds::new(100, 80)),
            pending_keys: PendingKeyCache::new(CacheBounds::new(100, 80)),
            pending_queries: PendingQueryCache::new(CacheBounds::new(100, 80)),
            capabilities: CapabilityCache::new(CacheBounds::new(100, 80)),
            connections: ConnectionCache::new(CacheBounds::new(100, 80)),
        })
    }

    #[test]
    fn hash_detection() {
        assert!(looks_like_hash(&"a".repeat(64)));
        assert!(looks_like_hash(&"0123456789abcdef".repeat(4)));
        assert!(!looks_like_hash("urn:x-rains:tlssrv"));
        assert!(!looks_like_hash(&"g".repeat(64)));
        assert!(!looks_like_hash(&"a".repeat(63)));
    }

    #[test]
    fn never_blocked_admits_everyone() {
        let predicate = NeverBlocked;
        let peer = Peer::tcp(SocketAddr::from(([203, 0, 113, 5], 1234)));
        assert!(!predicate.is_blocked(&peer));
    }

    #[test]
    fn deliver_enqueues_and_reports_overflow() {
        let caches = test_caches();
        let config = QueueConfig {
            normal_buffer: 1,
            ..QueueConfig::default()
        };
        let (fabric, _receivers) = QueueFabric::new(&config);
        let switchboard = Switchboard::new(
            caches,
            fabric,
            test_acceptor(),
            test_connector(),
            Arc::new(NeverBlocked),
            wire::DEFAULT_MSG_MAX_SIZE,
            Duration::from_secs(5),
            vec![Capability::tls_over_tcp()],
        );
        let peer = Peer::tcp(SocketAddr::from(([127, 0, 0, 1], 40000)));

        let query = crate::message::Query {
            name: "example.ch".to_string(),
            context: ".".to_string(),
            expiration: crate::message::unix_now() + 60,
            types: vec![crate::message::ObjectKind::Ip4],
            options: vec![],
        };
        let first = Message::query(Token::fresh(), query.clone());
        assert!(switchboard.deliver(first, peer).is_empty());

        // The single-slot queue is now full; the next section is dropped
        // and answered with a server error.
        let second = Message::query(Token::fresh(), query);
        let second_token = second.token;
        let replies = switchboard.deliver(second, peer);
        assert_eq!(replies.len(), 1);
        match &replies[0].content[0] {
            crate::message::Section::Notification(n) => {
                assert_eq!(n.kind, NotificationKind::UnspecServerErr);
                assert_eq!(n.token, second_token);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn capability_hash_exchange_paths() {
        let caches = test_caches();
        let (fabric, _receivers) = QueueFabric::new(&QueueConfig::default());
        let switchboard = Switchboard::new(
            caches.clone(),
            fabric,
            test_acceptor(),
            test_connector(),
            Arc::new(NeverBlocked),
            wire::DEFAULT_MSG_MAX_SIZE,
            Duration::from_secs(5),
            vec![Capability::tls_over_tcp()],
        );
        let advertiser = Peer::tcp(SocketAddr::from(([127, 0, 0, 1], 40100)));
        let hasher = Peer::tcp(SocketAddr::from(([127, 0, 0, 1], 40101)));
        let caps = vec![Capability::tls_over_tcp()];
        let hash = crate::message::capability_hash(&caps);

        // An unknown hash triggers the CapHashNotKnown exchange.
        let mut msg = Message::default();
        msg.capabilities = vec![Capability(hash.clone())];
        let replies = switchboard.deliver(msg, hasher);
        assert_eq!(replies.len(), 1);
        match &replies[0].content[0] {
            crate::message::Section::Notification(n) => {
                assert_eq!(n.kind, NotificationKind::CapHashNotKnown)
            }
            other => panic!("expected notification, got {other:?}"),
        }

        // A full advertisement teaches the cache; the hash then resolves.
        let mut full = Message::default();
        full.capabilities = caps.clone();
        assert!(switchboard.deliver(full, advertiser).is_empty());
        let mut again = Message::default();
        again.capabilities = vec![Capability(hash)];
        assert!(switchboard.deliver(again, hasher).is_empty());
        assert_eq!(caches.capabilities.get(&hasher), Some(caps));
    }

    #[tokio::test]
    async fn unreachable_peer_after_retries_with_backoff() {
        let caches = test_caches();
        let (fabric, _receivers) = QueueFabric::new(&QueueConfig::default());
        let switchboard = Arc::new(Switchboard::new(
            caches,
            fabric,
            test_acceptor(),
            test_connector(),
            Arc::new(NeverBlocked),
            wire::DEFAULT_MSG_MAX_SIZE,
            Duration::from_millis(500),
            vec![Capability::tls_over_tcp()],
        ));

        // TEST-NET-1 address: connects fail or time out, never succeed.
        let peer = Peer::tcp(SocketAddr::from(([192, 0, 2, 1], 55553)));
        let started = std::time::Instant::now();
        let result = switchboard
            .send_to(peer, Message::default(), 2, 10)
            .await;
        let elapsed = started.elapsed();

        match result {
            Err(SendError::Unreachable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Unreachable, got {other:?}"),
        }
        // Two backoff sleeps: 10ms + 20ms.
        assert!(elapsed >= Duration::from_millis(30), "backoff too short: {elapsed:?}");
    }

    // --- TLS plumbing for tests ---------------------------------------

    fn test_tls_identity() -> (Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>)
    {
        let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("cert generation");
        let cert = signed.cert.der().clone();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(signed.key_pair.serialize_der()),
        );
        (vec![cert], key)
    }

    fn test_acceptor() -> TlsAcceptor {
        let (certs, key) = test_tls_identity();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("server TLS config");
        TlsAcceptor::from(Arc::new(config))
    }

    fn test_connector() -> TlsConnector {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}
