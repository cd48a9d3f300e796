//! # Server Lifecycle
//!
//! The [`Server`] value owns everything a running instance needs: bound
//! configuration, the cache fabric, the trust engine, queues and workers,
//! the TLS identity, and the shutdown channel. There is no process-global
//! state; components receive what they use explicitly.
//!
//! ## Lifecycle
//!
//! - [`Server::new`] binds configuration: TLS identity and root
//!   delegation are loaded, the capability hash is precomputed, caches
//!   are built (and restored from checkpoints when preloading is on).
//! - [`Server::start`] binds the TCP listener, spawns the worker pools,
//!   the outbound pump, the keep-alive loop, the reapers and the
//!   checkpointer, then the accept loop.
//! - [`Server::shutdown`] broadcasts once; every pool finishes its
//!   in-flight item and exits without draining its queue.
//!
//! ## Configuration
//!
//! JSON, with the original key names. Durations are given in seconds
//! (hours for the per-kind validity caps) and converted on load.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    AssertionCache, CacheBounds, Caches, CapabilityCache, ConnectionCache, NegAssertionCache,
    PendingKeyCache, PendingQueryCache, ZoneKeyCache,
};
use crate::engine::{EngineConfig, MaxValidity, Outbound, TrustEngine};
use crate::message::Capability;
use crate::queue::{QueueConfig, QueueFabric, QueueReceivers};
use crate::signature::{KeyData, KeySpace, PublicKey};
use crate::switchboard::{AcceptAnyServerCert, IsBlocked, NeverBlocked, Switchboard};

/// Channel capacity of the engine-to-switchboard reply pump.
const OUTBOUND_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Errors
// ============================================================================

/// Startup failure classes, mapped to process exit codes by the CLI.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration is unreadable or invalid, or key material failed to
    /// load.
    Config(String),
    /// The listener socket could not be bound.
    Bind(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(detail) => write!(f, "configuration error: {detail}"),
            ServerError::Bind(detail) => write!(f, "bind error: {detail}"),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Configuration
// ============================================================================

fn default_keep_alive() -> u64 {
    60
}
fn default_tcp_timeout() -> u64 {
    5
}
fn default_buffer() -> usize {
    100
}
fn default_notify_buffer() -> usize {
    20
}
fn default_workers() -> usize {
    10
}
fn default_notify_workers() -> usize {
    2
}
fn default_cache_size() -> usize {
    1000
}
fn default_warn_size() -> usize {
    750
}
fn default_keys_per_zone() -> usize {
    5
}
fn default_query_validity() -> u64 {
    5
}
fn default_reap_timeout() -> u64 {
    30
}
fn default_checkpoint_interval() -> u64 {
    1800
}
fn default_msg_max_size() -> usize {
    crate::wire::DEFAULT_MSG_MAX_SIZE
}
fn default_capabilities() -> Vec<String> {
    vec![Capability::TLS_OVER_TCP.to_string()]
}

/// `ServerAddress` block: address type plus the TCP address fields.
#[derive(Clone, Debug, Deserialize)]
pub struct AddressConfig {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "TCPAddr")]
    pub tcp_addr: TcpAddrConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TcpAddrConfig {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Zone", default)]
    pub zone: String,
}

impl AddressConfig {
    fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        if !self.kind.is_empty() && self.kind != "TCP" {
            return Err(ServerError::Config(format!(
                "unsupported server address type {}",
                self.kind
            )));
        }
        let ip: std::net::IpAddr = self
            .tcp_addr
            .ip
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid server IP: {e}")))?;
        Ok(SocketAddr::new(ip, self.tcp_addr.port))
    }
}

/// Per-kind validity caps, in hours.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MaxCacheValidityConfig {
    #[serde(rename = "AssertionValidity")]
    pub assertion: i64,
    #[serde(rename = "ShardValidity")]
    pub shard: i64,
    #[serde(rename = "ZoneValidity")]
    pub zone: i64,
    #[serde(rename = "AddressAssertionValidity")]
    pub address_assertion: i64,
    #[serde(rename = "AddressZoneValidity")]
    pub address_zone: i64,
}

impl MaxCacheValidityConfig {
    fn to_max_validity(&self) -> MaxValidity {
        let fallback = MaxValidity::default();
        let hours = |h: i64, fallback: i64| if h > 0 { h * 3600 } else { fallback };
        MaxValidity {
            assertion: hours(self.assertion, fallback.assertion),
            shard: hours(self.shard, fallback.shard),
            zone: hours(self.zone, fallback.zone),
            address_assertion: hours(self.address_assertion, fallback.address_assertion),
            address_zone: hours(self.address_zone, fallback.address_zone),
        }
    }
}

/// Server configuration, bound from a JSON file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "RootZonePublicKeyPath", default)]
    pub root_zone_public_key_path: String,
    #[serde(rename = "ServerAddress")]
    pub server_address: AddressConfig,
    #[serde(rename = "KeepAlivePeriod", default = "default_keep_alive")]
    pub keep_alive_period_secs: u64,
    #[serde(rename = "TCPTimeout", default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,
    #[serde(rename = "TLSCertificateFile")]
    pub tls_certificate_file: String,
    #[serde(rename = "TLSPrivateKeyFile")]
    pub tls_private_key_file: String,
    #[serde(rename = "InsecureSkipVerify", default)]
    pub insecure_skip_verify: bool,
    #[serde(rename = "MsgMaxSize", default = "default_msg_max_size")]
    pub msg_max_size: usize,

    #[serde(rename = "PrioBufferSize", default = "default_buffer")]
    pub prio_buffer_size: usize,
    #[serde(rename = "NormalBufferSize", default = "default_buffer")]
    pub normal_buffer_size: usize,
    #[serde(rename = "NotificationBufferSize", default = "default_notify_buffer")]
    pub notification_buffer_size: usize,
    #[serde(rename = "PrioWorkerCount", default = "default_workers")]
    pub prio_worker_count: usize,
    #[serde(rename = "NormalWorkerCount", default = "default_workers")]
    pub normal_worker_count: usize,
    #[serde(rename = "NotificationWorkerCount", default = "default_notify_workers")]
    pub notification_worker_count: usize,

    #[serde(rename = "ZoneKeyCacheSize", default = "default_cache_size")]
    pub zone_key_cache_size: usize,
    #[serde(rename = "ZoneKeyCacheWarnSize", default = "default_warn_size")]
    pub zone_key_cache_warn_size: usize,
    #[serde(rename = "MaxPublicKeysPerZone", default = "default_keys_per_zone")]
    pub max_public_keys_per_zone: usize,
    #[serde(rename = "AssertionCacheSize", default = "default_cache_size")]
    pub assertion_cache_size: usize,
    #[serde(rename = "NegativeAssertionCacheSize", default = "default_cache_size")]
    pub negative_assertion_cache_size: usize,
    #[serde(rename = "PendingKeyCacheSize", default = "default_cache_size")]
    pub pending_key_cache_size: usize,
    #[serde(rename = "PendingQueryCacheSize", default = "default_cache_size")]
    pub pending_query_cache_size: usize,
    #[serde(rename = "CapabilitiesCacheSize", default = "default_cache_size")]
    pub capabilities_cache_size: usize,

    #[serde(rename = "Capabilities", default = "default_capabilities")]
    pub capabilities: Vec<String>,

    #[serde(rename = "DelegationQueryValidity", default = "default_query_validity")]
    pub delegation_query_validity_secs: u64,
    #[serde(rename = "QueryValidity", default = "default_query_validity")]
    pub query_validity_secs: u64,
    #[serde(rename = "AddressQueryValidity", default = "default_query_validity")]
    pub address_query_validity_secs: u64,
    #[serde(rename = "ReapVerifyTimeout", default = "default_reap_timeout")]
    pub reap_verify_timeout_secs: u64,

    #[serde(rename = "MaxCacheValidity", default)]
    pub max_cache_validity: MaxCacheValidityConfig,

    #[serde(rename = "ContextAuthority", default)]
    pub context_authority: Vec<String>,
    #[serde(rename = "ZoneAuthority", default)]
    pub zone_authority: Vec<String>,

    #[serde(rename = "AssertionCheckPointInterval", default = "default_checkpoint_interval")]
    pub assertion_check_point_interval_secs: u64,
    #[serde(
        rename = "NegAssertionCheckPointInterval",
        default = "default_checkpoint_interval"
    )]
    pub neg_assertion_check_point_interval_secs: u64,
    #[serde(rename = "ZoneKeyCheckPointInterval", default = "default_checkpoint_interval")]
    pub zone_key_check_point_interval_secs: u64,
    #[serde(rename = "CheckPointPath", default)]
    pub check_point_path: String,
    #[serde(rename = "PreLoadCaches", default)]
    pub pre_load_caches: bool,
}

impl Config {
    /// Load and bind configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Config, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("parsing {}: {e}", path.display())))
    }

    fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            prio_buffer: self.prio_buffer_size,
            normal_buffer: self.normal_buffer_size,
            notify_buffer: self.notification_buffer_size,
            prio_workers: self.prio_worker_count,
            normal_workers: self.normal_worker_count,
            notify_workers: self.notification_worker_count,
        }
    }

    fn capability_list(&self) -> Vec<Capability> {
        self.capabilities.iter().map(|c| Capability(c.clone())).collect()
    }

    /// (zone, context) authority pairs, zipped positionally as configured.
    fn authority(&self) -> HashSet<(String, String)> {
        self.zone_authority
            .iter()
            .zip(&self.context_authority)
            .map(|(zone, context)| (zone.clone(), context.clone()))
            .collect()
    }

    fn checkpoint_file(&self, name: &str) -> Option<PathBuf> {
        if self.check_point_path.is_empty() {
            None
        } else {
            Some(Path::new(&self.check_point_path).join(name))
        }
    }
}

/// Boot delegation file: the root zone's public key with its validity
/// window, JSON-encoded.
#[derive(Debug, Deserialize)]
struct RootKeyFile {
    #[serde(rename = "Zone", default)]
    zone: Option<String>,
    #[serde(rename = "Context", default)]
    context: Option<String>,
    #[serde(rename = "Algorithm")]
    algorithm: String,
    #[serde(rename = "KeyPhase", default)]
    key_phase: u32,
    #[serde(rename = "ValidSince")]
    valid_since: i64,
    #[serde(rename = "ValidUntil")]
    valid_until: i64,
    #[serde(rename = "Key")]
    key_hex: String,
}

fn load_root_zone_key(path: &Path) -> Result<(String, String, PublicKey), ServerError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("reading root key {}: {e}", path.display())))?;
    let file: RootKeyFile = serde_json::from_str(&raw)
        .map_err(|e| ServerError::Config(format!("parsing root key {}: {e}", path.display())))?;
    let bytes = hex::decode(&file.key_hex)
        .map_err(|e| ServerError::Config(format!("root key is not hex: {e}")))?;
    let key = match file.algorithm.as_str() {
        "Ed25519" => {
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| ServerError::Config("Ed25519 root key must be 32 bytes".into()))?;
            KeyData::Ed25519(arr)
        }
        "EcdsaP256" => KeyData::EcdsaP256(bytes),
        "EcdsaP384" => KeyData::EcdsaP384(bytes),
        other => {
            return Err(ServerError::Config(format!(
                "unsupported root key algorithm {other}"
            )))
        }
    };
    if file.valid_since > file.valid_until {
        return Err(ServerError::Config("root key validity window is inverted".into()));
    }
    Ok((
        file.zone.unwrap_or_else(|| ".".to_string()),
        file.context.unwrap_or_else(|| ".".to_string()),
        PublicKey {
            key_space: KeySpace::Rains,
            key_phase: file.key_phase,
            valid_since: file.valid_since,
            valid_until: file.valid_until,
            key,
        },
    ))
}

// ============================================================================
// TLS Setup
// ============================================================================

fn load_tls_identity(
    cert_path: &str,
    key_path: &str,
) -> Result<
    (
        Vec<rustls::pki_types::CertificateDer<'static>>,
        rustls::pki_types::PrivateKeyDer<'static>,
    ),
    ServerError,
> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ServerError::Config(format!("opening certificate {cert_path}: {e}")))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Config(format!("parsing certificate {cert_path}: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Config(format!(
            "no certificates found in {cert_path}"
        )));
    }
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ServerError::Config(format!("opening private key {key_path}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| ServerError::Config(format!("parsing private key {key_path}: {e}")))?
        .ok_or_else(|| ServerError::Config(format!("no private key found in {key_path}")))?;
    Ok((certs, key))
}

fn build_tls(
    config: &Config,
) -> Result<(tokio_rustls::TlsAcceptor, tokio_rustls::TlsConnector), ServerError> {
    let (certs, key) = load_tls_identity(&config.tls_certificate_file, &config.tls_private_key_file)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs.clone(), key)
        .map_err(|e| ServerError::Config(format!("building server TLS config: {e}")))?;

    let client_config = if config.insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        // Peers are pinned against the roots shipped alongside the server
        // certificate.
        let mut roots = rustls::RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| ServerError::Config(format!("building root store: {e}")))?;
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok((
        tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        tokio_rustls::TlsConnector::from(Arc::new(client_config)),
    ))
}

// ============================================================================
// Server
// ============================================================================

pub struct Server {
    config: Config,
    caches: Arc<Caches>,
    engine: Arc<TrustEngine>,
    switchboard: Arc<Switchboard>,
    fabric: QueueFabric,
    receivers: Option<QueueReceivers>,
    out_tx: mpsc::Sender<Outbound>,
    out_rx: Option<mpsc::Receiver<Outbound>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind configuration into a server value: load TLS identity and the
    /// root delegation, build caches (restoring checkpoints when
    /// preloading), wire queues, engine and switchboard.
    pub fn new(config: Config) -> Result<Server, ServerError> {
        Self::with_blocked(config, Arc::new(NeverBlocked))
    }

    /// Like [`Server::new`] with an explicit blocked-peer policy.
    pub fn with_blocked(config: Config, blocked: Arc<dyn IsBlocked>) -> Result<Server, ServerError> {
        let caches = Arc::new(Caches {
            zone_keys: ZoneKeyCache::new(
                CacheBounds::new(config.zone_key_cache_size, config.zone_key_cache_warn_size),
                config.max_public_keys_per_zone,
            ),
            assertions: AssertionCache::new(CacheBounds::new(
                config.assertion_cache_size,
                warn_of(config.assertion_cache_size),
            )),
            negatives: NegAssertionCache::new(CacheBounds::new(
                config.negative_assertion_cache_size,
                warn_of(config.negative_assertion_cache_size),
            )),
            pending_keys: PendingKeyCache::new(CacheBounds::new(
                config.pending_key_cache_size,
                warn_of(config.pending_key_cache_size),
            )),
            pending_queries: PendingQueryCache::new(CacheBounds::new(
                config.pending_query_cache_size,
                warn_of(config.pending_query_cache_size),
            )),
            capabilities: CapabilityCache::new(CacheBounds::new(
                config.capabilities_cache_size,
                warn_of(config.capabilities_cache_size),
            )),
            connections: ConnectionCache::new(CacheBounds::new(
                config.capabilities_cache_size.max(64),
                warn_of(config.capabilities_cache_size.max(64)),
            )),
        });

        if config.root_zone_public_key_path.is_empty() {
            warn!("no root zone public key configured; nothing is trusted at boot");
        } else {
            let (zone, context, key) =
                load_root_zone_key(Path::new(&config.root_zone_public_key_path))?;
            caches.zone_keys.add(&zone, &context, key);
            info!(%zone, %context, "loaded root zone public key");
        }

        if config.pre_load_caches {
            restore_checkpoints(&config, &caches);
        }

        let (acceptor, connector) = build_tls(&config)?;

        let engine_config = EngineConfig {
            max_validity: config.max_cache_validity.to_max_validity(),
            delegation_query_validity: config.delegation_query_validity_secs as i64,
            query_validity: config.query_validity_secs as i64,
            authority: config.authority(),
            capabilities: config.capability_list(),
        };
        let engine = Arc::new(TrustEngine::new(caches.clone(), engine_config));

        let (fabric, receivers) = QueueFabric::new(&config.queue_config());
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (shutdown_tx, _) = broadcast::channel(4);

        let switchboard = Arc::new(Switchboard::new(
            caches.clone(),
            fabric.clone(),
            acceptor,
            connector,
            blocked,
            config.msg_max_size,
            Duration::from_secs(config.tcp_timeout_secs.max(1)),
            config.capability_list(),
        ));
        info!(hash = switchboard.capability_hash(), "capability hash precomputed");

        Ok(Server {
            config,
            caches,
            engine,
            switchboard,
            fabric,
            receivers: Some(receivers),
            out_tx,
            out_rx: Some(out_rx),
            shutdown_tx,
            tasks: Vec::new(),
            local_addr: None,
        })
    }

    /// Bind the listener and spawn every background task. Returns once
    /// the server is accepting connections.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let addr = self.config.server_address.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("binding {addr}: {e}")))?;
        self.local_addr = listener
            .local_addr()
            .ok()
            .or(Some(addr));

        let receivers = self
            .receivers
            .take()
            .ok_or_else(|| ServerError::Config("server already started".into()))?;
        let out_rx = self
            .out_rx
            .take()
            .ok_or_else(|| ServerError::Config("server already started".into()))?;

        self.tasks.extend(crate::queue::spawn_workers(
            receivers,
            &self.config.queue_config(),
            self.engine.clone(),
            self.out_tx.clone(),
            &self.shutdown_tx,
        ));
        self.tasks.push(tokio::spawn(
            self.switchboard
                .clone()
                .run_outbound(out_rx, self.shutdown_tx.subscribe()),
        ));
        self.tasks.push(tokio::spawn(self.switchboard.clone().run_keepalive(
            Duration::from_secs(self.config.keep_alive_period_secs.max(1)),
            self.shutdown_tx.subscribe(),
        )));
        self.spawn_reapers();
        self.tasks.push(tokio::spawn(
            self.switchboard
                .clone()
                .listen(listener, self.shutdown_tx.subscribe()),
        ));
        info!(%addr, "server started");
        Ok(())
    }

    /// Reapers: per-cache TTL expiry plus checkpointing on the configured
    /// intervals, and the pending-cache timeout sweep.
    fn spawn_reapers(&mut self) {
        let caches = self.caches.clone();
        let path = self.config.checkpoint_file("assertions");
        self.tasks.push(spawn_reaper(
            "assertions",
            self.config.assertion_check_point_interval_secs,
            self.shutdown_tx.subscribe(),
            move || {
                let removed = caches.assertions.remove_expired(crate::message::unix_now());
                if removed > 0 {
                    debug!(removed, "reaped expired assertions");
                }
                if let Some(path) = &path {
                    if let Err(e) = caches.assertions.checkpoint(path) {
                        warn!(error = %e, "assertion checkpoint failed");
                    }
                }
            },
        ));

        let caches = self.caches.clone();
        let path = self.config.checkpoint_file("negative_assertions");
        self.tasks.push(spawn_reaper(
            "negative_assertions",
            self.config.neg_assertion_check_point_interval_secs,
            self.shutdown_tx.subscribe(),
            move || {
                let removed = caches.negatives.remove_expired(crate::message::unix_now());
                if removed > 0 {
                    debug!(removed, "reaped expired negative assertions");
                }
                if let Some(path) = &path {
                    if let Err(e) = caches.negatives.checkpoint(path) {
                        warn!(error = %e, "negative-assertion checkpoint failed");
                    }
                }
            },
        ));

        let caches = self.caches.clone();
        let path = self.config.checkpoint_file("zone_keys");
        self.tasks.push(spawn_reaper(
            "zone_keys",
            self.config.zone_key_check_point_interval_secs,
            self.shutdown_tx.subscribe(),
            move || {
                let removed = caches.zone_keys.remove_expired(crate::message::unix_now());
                if removed > 0 {
                    debug!(removed, "reaped expired zone keys");
                }
                if let Some(path) = &path {
                    if let Err(e) = caches.zone_keys.checkpoint(path) {
                        warn!(error = %e, "zone-key checkpoint failed");
                    }
                }
            },
        ));

        // Pending entries age out on their own timer; blocked requesters
        // are notified through the outbound pump.
        let engine = self.engine.clone();
        let out_tx = self.out_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.reap_verify_timeout_secs.max(1));
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {}
                }
                for outbound in engine.reap_pending(crate::message::unix_now()) {
                    if out_tx.send(outbound).await.is_err() {
                        return;
                    }
                }
            }
        }));
    }

    /// Broadcast shutdown. Worker pools finish their in-flight item; the
    /// listener and pumps exit.
    pub fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for every background task to finish.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    pub fn engine(&self) -> &Arc<TrustEngine> {
        &self.engine
    }

    pub fn switchboard(&self) -> &Arc<Switchboard> {
        &self.switchboard
    }

    pub fn queue_fabric(&self) -> &QueueFabric {
        &self.fabric
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn warn_of(hard: usize) -> usize {
    hard.saturating_mul(3) / 4
}

fn restore_checkpoints(config: &Config, caches: &Caches) {
    let restore = |name: &str, result: anyhow::Result<usize>| match result {
        Ok(count) => info!(cache = name, count, "restored checkpoint"),
        Err(e) => warn!(cache = name, error = %e, "checkpoint restore failed"),
    };
    if let Some(path) = config.checkpoint_file("assertions") {
        restore("assertions", caches.assertions.restore(&path));
    }
    if let Some(path) = config.checkpoint_file("negative_assertions") {
        restore("negative_assertions", caches.negatives.restore(&path));
    }
    if let Some(path) = config.checkpoint_file("zone_keys") {
        restore("zone_keys", caches.zone_keys.restore(&path));
    }
}

fn spawn_reaper<F>(
    name: &'static str,
    interval_secs: u64,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            tick();
        }
        debug!(reaper = name, "reaper stopped");
    })
}
