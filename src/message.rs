//! # Message Data Model
//!
//! Wire-level types for RAINS messages and their sections, plus the total
//! order that canonical serialization and consistency checking rely on.
//!
//! ## Sections
//!
//! A [`Message`] carries a 16-byte [`Token`] and an ordered sequence of
//! [`Section`]s. Eight section variants exist, grouped by role:
//!
//! | Role | Variants |
//! |------|----------|
//! | Signable, zone-scoped | `Assertion`, `Shard`, `Zone` (zones also contain `Pshard`s) |
//! | Signable, address-scoped | `AddressAssertion`, `AddressZone` |
//! | Unsigned | `Query`, `AddressQuery`, `Notification` |
//!
//! ## Ordering
//!
//! Sections have a total order: first by section kind (AddressQuery,
//! AddressZone, AddressAssertion, Assertion, Shard, Zone, Query,
//! Notification), then lexicographically on each kind's natural keys.
//! [`Message::sort`] applies this order recursively; it is the first step
//! on both the send path (before signing) and the receive path (before
//! consistency checks), and is idempotent.
//!
//! Shard range endpoints use `""` for negative (`range_from`) and positive
//! (`range_to`) infinity; they compare accordingly.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::signature::{KeySpace, PublicKey, Signature};

/// Current time as Unix seconds. All validity arithmetic in the server is
/// in this domain.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Token
// ============================================================================

/// 16-byte correlator tying a reply to a pending query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub [u8; 16]);

impl Token {
    /// A fresh random token.
    pub fn fresh() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Token(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ============================================================================
// Peers
// ============================================================================

/// Address of one endpoint of a connection. The design admits pluggable
/// transports; TCP is the one specified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Peer {
    Tcp(std::net::SocketAddr),
}

impl Peer {
    pub fn tcp(addr: std::net::SocketAddr) -> Self {
        Peer::Tcp(addr)
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        match self {
            Peer::Tcp(addr) => *addr,
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// A capability URN advertised by a peer. The empty string denotes no
/// capability.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability(pub String);

impl Capability {
    pub const NONE: &'static str = "";
    pub const TLS_OVER_TCP: &'static str = "urn:x-rains:tlssrv";

    pub fn tls_over_tcp() -> Self {
        Capability(Self::TLS_OVER_TCP.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hex SHA-256 over the canonically sorted capability list. The hash may
/// stand in for the list on the wire after a prior advertisement.
pub fn capability_hash(capabilities: &[Capability]) -> String {
    let mut sorted: Vec<&str> = capabilities.iter().map(|c| c.as_str()).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for (i, cap) in sorted.iter().enumerate() {
        if i > 0 {
            hasher.update(b" ");
        }
        hasher.update(cap.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// Objects
// ============================================================================

/// Discriminant for [`Object`] variants, with RAINS wire numbers. Queries
/// request object kinds; the assertion cache indexes on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Name = 1,
    Ip6 = 2,
    Ip4 = 3,
    Redirection = 4,
    Delegation = 5,
    NameSet = 6,
    Certificate = 7,
    ServiceInfo = 8,
    Registrar = 9,
    Registrant = 10,
    InfraKey = 11,
    ExtraKey = 12,
    NextKey = 13,
}

impl ObjectKind {
    pub fn wire(self) -> u8 {
        self as u8
    }
}

/// Name object payload: an alias to `name` restricted to the listed kinds.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NameObject {
    pub name: String,
    pub kinds: Vec<ObjectKind>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    Unspecified = 0,
    Tls = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CertificateUsage {
    TrustAnchor = 2,
    EndEntity = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    NoHash = 0,
    Sha256 = 1,
    Sha384 = 2,
    Sha512 = 3,
    Fnv64 = 4,
    Murmur364 = 5,
}

/// Certificate object payload.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CertificateObject {
    pub protocol: ProtocolType,
    pub usage: CertificateUsage,
    pub hash_algorithm: HashAlgorithm,
    pub data: Vec<u8>,
}

/// Service info object payload.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub port: u16,
    pub priority: u32,
}

/// A tagged object value bound to a subject name by an assertion.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Object {
    Name(NameObject),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Redirection(String),
    Delegation(PublicKey),
    NameSet(String),
    Certificate(CertificateObject),
    ServiceInfo(ServiceInfo),
    Registrar(String),
    Registrant(String),
    InfraKey(PublicKey),
    ExtraKey { key_space: KeySpace, key: PublicKey },
    NextKey { key: PublicKey, valid_since: i64, valid_until: i64 },
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Name(_) => ObjectKind::Name,
            Object::Ip4(_) => ObjectKind::Ip4,
            Object::Ip6(_) => ObjectKind::Ip6,
            Object::Redirection(_) => ObjectKind::Redirection,
            Object::Delegation(_) => ObjectKind::Delegation,
            Object::NameSet(_) => ObjectKind::NameSet,
            Object::Certificate(_) => ObjectKind::Certificate,
            Object::ServiceInfo(_) => ObjectKind::ServiceInfo,
            Object::Registrar(_) => ObjectKind::Registrar,
            Object::Registrant(_) => ObjectKind::Registrant,
            Object::InfraKey(_) => ObjectKind::InfraKey,
            Object::ExtraKey { .. } => ObjectKind::ExtraKey,
            Object::NextKey { .. } => ObjectKind::NextKey,
        }
    }
}

// ============================================================================
// Address Scope
// ============================================================================

/// An IP subnet: address plus prefix length. Orders by prefix length, then
/// by address bytes, so more specific subnets sort after their covering
/// networks of equal family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Subnet { addr, prefix_len }
    }
}

impl PartialOrd for Subnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Subnet {
    fn cmp(&self, other: &Self) -> Ordering {
        fn key(s: &Subnet) -> (u8, Vec<u8>) {
            let bytes = match s.addr {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            (s.prefix_len, bytes)
        }
        key(self).cmp(&key(other))
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

// ============================================================================
// Signable Sections
// ============================================================================

/// A signed statement binding `subject_name` in (`subject_zone`, `context`)
/// to one or more objects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub subject_name: String,
    pub subject_zone: String,
    pub context: String,
    pub content: Vec<Object>,
    pub signatures: Vec<Signature>,
    /// Effective validity window, maintained by the trust engine. Not part
    /// of the signed encoding.
    pub valid_since: i64,
    pub valid_until: i64,
}

impl Assertion {
    pub fn sort(&mut self) {
        self.content.sort();
    }

    pub fn compare_to(&self, other: &Assertion) -> Ordering {
        (&self.context, &self.subject_zone, &self.subject_name, &self.content).cmp(&(
            &other.context,
            &other.subject_zone,
            &other.subject_name,
            &other.content,
        ))
    }

    /// Objects of the given kind carried by this assertion.
    pub fn objects_of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &Object> {
        self.content.iter().filter(move |o| o.kind() == kind)
    }
}

/// A signed lexicographic range of assertions. An open `range_from` (`""`)
/// means negative infinity, an open `range_to` positive infinity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub subject_zone: String,
    pub context: String,
    pub range_from: String,
    pub range_to: String,
    pub content: Vec<Assertion>,
    pub signatures: Vec<Signature>,
    pub valid_since: i64,
    pub valid_until: i64,
}

impl Shard {
    pub fn sort(&mut self) {
        for a in &mut self.content {
            a.sort();
        }
        self.content.sort_by(|a, b| a.compare_to(b));
    }

    pub fn compare_to(&self, other: &Shard) -> Ordering {
        (&self.context, &self.subject_zone)
            .cmp(&(&other.context, &other.subject_zone))
            .then_with(|| range_endpoint_cmp(&self.range_from, &other.range_from, false))
            .then_with(|| range_endpoint_cmp(&self.range_to, &other.range_to, true))
            .then_with(|| {
                for (a, b) in self.content.iter().zip(other.content.iter()) {
                    let ord = a.compare_to(b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                self.content.len().cmp(&other.content.len())
            })
    }

    /// True if `name` lies within `[range_from, range_to)`.
    pub fn in_range(&self, name: &str) -> bool {
        (self.range_from.is_empty() || self.range_from.as_str() <= name)
            && (self.range_to.is_empty() || name < self.range_to.as_str())
    }
}

/// Bloom filter mode of operation for pshards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModeOfOperation {
    Standard = 0,
    KirschMitzenmacher1 = 1,
    KirschMitzenmacher2 = 2,
}

/// Bloom filter summarizing the names present in a pshard's range.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BloomFilter {
    pub hash_family: Vec<HashAlgorithm>,
    pub hash_count: u32,
    pub mode: ModeOfOperation,
    pub filter: Vec<u8>,
}

/// A shard summarized by a Bloom filter instead of enumerated assertions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pshard {
    pub subject_zone: String,
    pub context: String,
    pub range_from: String,
    pub range_to: String,
    pub filter: BloomFilter,
    pub signatures: Vec<Signature>,
    pub valid_since: i64,
    pub valid_until: i64,
}

impl Pshard {
    pub fn compare_to(&self, other: &Pshard) -> Ordering {
        (&self.context, &self.subject_zone)
            .cmp(&(&other.context, &other.subject_zone))
            .then_with(|| range_endpoint_cmp(&self.range_from, &other.range_from, false))
            .then_with(|| range_endpoint_cmp(&self.range_to, &other.range_to, true))
            .then_with(|| self.filter.cmp(&other.filter))
    }

    pub fn in_range(&self, name: &str) -> bool {
        (self.range_from.is_empty() || self.range_from.as_str() <= name)
            && (self.range_to.is_empty() || name < self.range_to.as_str())
    }
}

/// Content of a zone: assertions, shards and pshards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneContent {
    Assertion(Assertion),
    Shard(Shard),
    Pshard(Pshard),
}

impl ZoneContent {
    fn rank(&self) -> u8 {
        match self {
            ZoneContent::Assertion(_) => 0,
            ZoneContent::Shard(_) => 1,
            ZoneContent::Pshard(_) => 2,
        }
    }

    fn sort(&mut self) {
        match self {
            ZoneContent::Assertion(a) => a.sort(),
            ZoneContent::Shard(s) => s.sort(),
            ZoneContent::Pshard(_) => {}
        }
    }

    fn compare_to(&self, other: &ZoneContent) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (ZoneContent::Assertion(a), ZoneContent::Assertion(b)) => a.compare_to(b),
            (ZoneContent::Shard(a), ZoneContent::Shard(b)) => a.compare_to(b),
            (ZoneContent::Pshard(a), ZoneContent::Pshard(b)) => a.compare_to(b),
            _ => Ordering::Equal,
        })
    }
}

/// A signed zone: the authoritative collection of a zone's assertions,
/// shards and pshards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub subject_zone: String,
    pub context: String,
    pub content: Vec<ZoneContent>,
    pub signatures: Vec<Signature>,
    pub valid_since: i64,
    pub valid_until: i64,
}

impl Zone {
    pub fn sort(&mut self) {
        for c in &mut self.content {
            c.sort();
        }
        self.content.sort_by(|a, b| a.compare_to(b));
    }

    pub fn compare_to(&self, other: &Zone) -> Ordering {
        (&self.context, &self.subject_zone)
            .cmp(&(&other.context, &other.subject_zone))
            .then_with(|| {
                for (a, b) in self.content.iter().zip(other.content.iter()) {
                    let ord = a.compare_to(b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                self.content.len().cmp(&other.content.len())
            })
    }
}

/// A signed statement binding an IP subnet to objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssertion {
    pub subject_addr: Subnet,
    pub context: String,
    pub content: Vec<Object>,
    pub signatures: Vec<Signature>,
    pub valid_since: i64,
    pub valid_until: i64,
}

impl AddressAssertion {
    pub fn sort(&mut self) {
        self.content.sort();
    }

    pub fn compare_to(&self, other: &AddressAssertion) -> Ordering {
        (&self.context, &self.subject_addr, &self.content).cmp(&(
            &other.context,
            &other.subject_addr,
            &other.content,
        ))
    }
}

/// A signed address zone: address assertions under a covering subnet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressZone {
    pub subject_addr: Subnet,
    pub context: String,
    pub content: Vec<AddressAssertion>,
    pub signatures: Vec<Signature>,
    pub valid_since: i64,
    pub valid_until: i64,
}

impl AddressZone {
    pub fn sort(&mut self) {
        for a in &mut self.content {
            a.sort();
        }
        self.content.sort_by(|a, b| a.compare_to(b));
    }

    pub fn compare_to(&self, other: &AddressZone) -> Ordering {
        (&self.context, &self.subject_addr)
            .cmp(&(&other.context, &other.subject_addr))
            .then_with(|| {
                for (a, b) in self.content.iter().zip(other.content.iter()) {
                    let ord = a.compare_to(b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                self.content.len().cmp(&other.content.len())
            })
    }
}

// ============================================================================
// Unsigned Sections
// ============================================================================

/// Query option flags with their wire numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryOption {
    MinE2ELatency = 1,
    MinLastHopAnswerSize = 2,
    MinInfoLeakage = 3,
    CachedAnswersOnly = 4,
    ExpiredAssertionsOk = 5,
    TokenTracing = 6,
    NoVerificationDelegation = 7,
    NoProactiveCaching = 8,
}

/// A query for objects bound to `name` in (`context`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    pub context: String,
    /// Unix seconds after which the query is void.
    pub expiration: i64,
    pub types: Vec<ObjectKind>,
    pub options: Vec<QueryOption>,
}

impl Query {
    pub fn sort(&mut self) {
        self.types.sort();
        self.options.sort();
    }

    pub fn compare_to(&self, other: &Query) -> Ordering {
        (&self.context, &self.name, self.expiration, &self.types, &self.options).cmp(&(
            &other.context,
            &other.name,
            other.expiration,
            &other.types,
            &other.options,
        ))
    }

    pub fn has_option(&self, option: QueryOption) -> bool {
        self.options.contains(&option)
    }
}

/// A query for objects bound to an IP subnet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressQuery {
    pub subject_addr: Subnet,
    pub context: String,
    pub expiration: i64,
    pub types: Vec<ObjectKind>,
    pub options: Vec<QueryOption>,
}

impl AddressQuery {
    pub fn sort(&mut self) {
        self.types.sort();
        self.options.sort();
    }

    pub fn compare_to(&self, other: &AddressQuery) -> Ordering {
        (&self.context, &self.subject_addr, self.expiration, &self.types, &self.options).cmp(&(
            &other.context,
            &other.subject_addr,
            other.expiration,
            &other.types,
            &other.options,
        ))
    }

    pub fn has_option(&self, option: QueryOption) -> bool {
        self.options.contains(&option)
    }
}

/// Notification codes with their wire numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Heartbeat = 100,
    CapHashNotKnown = 399,
    BadMessage = 400,
    RcvInconsistentMsg = 403,
    NoAssertionsExist = 404,
    MsgTooLarge = 413,
    UnspecServerErr = 500,
    ServerNotCapable = 501,
    NoAssertionAvail = 504,
}

impl NotificationKind {
    pub fn wire(self) -> u16 {
        self as u16
    }
}

/// An unsigned control message, echoing the token it refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub token: Token,
    pub kind: NotificationKind,
    pub data: String,
}

impl Notification {
    pub fn compare_to(&self, other: &Notification) -> Ordering {
        (&self.token, self.kind, &self.data).cmp(&(&other.token, other.kind, &other.data))
    }
}

// ============================================================================
// Section
// ============================================================================

/// One section of a message. Operations the engine needs (`sort`,
/// `compare_to`, signature and scope accessors, validity) dispatch on the
/// variant tag here, so the trust engine never runtime-type-tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    Assertion(Assertion),
    Shard(Shard),
    Zone(Zone),
    AddressAssertion(AddressAssertion),
    AddressZone(AddressZone),
    Query(Query),
    AddressQuery(AddressQuery),
    Notification(Notification),
}

impl Section {
    /// Rank in the canonical section order.
    fn rank(&self) -> u8 {
        match self {
            Section::AddressQuery(_) => 0,
            Section::AddressZone(_) => 1,
            Section::AddressAssertion(_) => 2,
            Section::Assertion(_) => 3,
            Section::Shard(_) => 4,
            Section::Zone(_) => 5,
            Section::Query(_) => 6,
            Section::Notification(_) => 7,
        }
    }

    /// Recursively sort contained content.
    pub fn sort(&mut self) {
        match self {
            Section::Assertion(a) => a.sort(),
            Section::Shard(s) => s.sort(),
            Section::Zone(z) => z.sort(),
            Section::AddressAssertion(a) => a.sort(),
            Section::AddressZone(z) => z.sort(),
            Section::Query(q) => q.sort(),
            Section::AddressQuery(q) => q.sort(),
            Section::Notification(_) => {}
        }
    }

    /// Total order over sections: kind rank, then per-kind natural keys.
    pub fn compare_to(&self, other: &Section) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (Section::Assertion(a), Section::Assertion(b)) => a.compare_to(b),
            (Section::Shard(a), Section::Shard(b)) => a.compare_to(b),
            (Section::Zone(a), Section::Zone(b)) => a.compare_to(b),
            (Section::AddressAssertion(a), Section::AddressAssertion(b)) => a.compare_to(b),
            (Section::AddressZone(a), Section::AddressZone(b)) => a.compare_to(b),
            (Section::Query(a), Section::Query(b)) => a.compare_to(b),
            (Section::AddressQuery(a), Section::AddressQuery(b)) => a.compare_to(b),
            (Section::Notification(a), Section::Notification(b)) => a.compare_to(b),
            _ => Ordering::Equal,
        })
    }

    /// True for the five signable variants.
    pub fn is_signable(&self) -> bool {
        matches!(
            self,
            Section::Assertion(_)
                | Section::Shard(_)
                | Section::Zone(_)
                | Section::AddressAssertion(_)
                | Section::AddressZone(_)
        )
    }

    /// Signatures of a signable section; `None` for unsigned variants.
    pub fn signatures(&self) -> Option<&[Signature]> {
        match self {
            Section::Assertion(a) => Some(&a.signatures),
            Section::Shard(s) => Some(&s.signatures),
            Section::Zone(z) => Some(&z.signatures),
            Section::AddressAssertion(a) => Some(&a.signatures),
            Section::AddressZone(z) => Some(&z.signatures),
            _ => None,
        }
    }

    pub fn signatures_mut(&mut self) -> Option<&mut Vec<Signature>> {
        match self {
            Section::Assertion(a) => Some(&mut a.signatures),
            Section::Shard(s) => Some(&mut s.signatures),
            Section::Zone(z) => Some(&mut z.signatures),
            Section::AddressAssertion(a) => Some(&mut a.signatures),
            Section::AddressZone(z) => Some(&mut z.signatures),
            _ => None,
        }
    }

    /// Context of a signable section.
    pub fn context(&self) -> Option<&str> {
        match self {
            Section::Assertion(a) => Some(&a.context),
            Section::Shard(s) => Some(&s.context),
            Section::Zone(z) => Some(&z.context),
            Section::AddressAssertion(a) => Some(&a.context),
            Section::AddressZone(z) => Some(&z.context),
            _ => None,
        }
    }

    /// Subject zone of a zone-scoped signable section. Address-scoped
    /// sections key on their subnet instead and report the empty zone.
    pub fn subject_zone(&self) -> Option<&str> {
        match self {
            Section::Assertion(a) => Some(&a.subject_zone),
            Section::Shard(s) => Some(&s.subject_zone),
            Section::Zone(z) => Some(&z.subject_zone),
            Section::AddressAssertion(_) | Section::AddressZone(_) => Some(""),
            _ => None,
        }
    }

    pub fn valid_since(&self) -> i64 {
        match self {
            Section::Assertion(a) => a.valid_since,
            Section::Shard(s) => s.valid_since,
            Section::Zone(z) => z.valid_since,
            Section::AddressAssertion(a) => a.valid_since,
            Section::AddressZone(z) => z.valid_since,
            _ => 0,
        }
    }

    pub fn valid_until(&self) -> i64 {
        match self {
            Section::Assertion(a) => a.valid_until,
            Section::Shard(s) => s.valid_until,
            Section::Zone(z) => z.valid_until,
            Section::AddressAssertion(a) => a.valid_until,
            Section::AddressZone(z) => z.valid_until,
            _ => 0,
        }
    }

    /// Widen the section's effective validity window to include
    /// `[since, until]`, capping the upper end at `now + max_validity`.
    pub fn update_validity(&mut self, since: i64, until: i64, max_validity_secs: i64) {
        let cap = unix_now().saturating_add(max_validity_secs);
        let until = until.min(cap);
        let (vs, vu) = match self {
            Section::Assertion(a) => (&mut a.valid_since, &mut a.valid_until),
            Section::Shard(s) => (&mut s.valid_since, &mut s.valid_until),
            Section::Zone(z) => (&mut z.valid_since, &mut z.valid_until),
            Section::AddressAssertion(a) => (&mut a.valid_since, &mut a.valid_until),
            Section::AddressZone(z) => (&mut z.valid_since, &mut z.valid_until),
            _ => return,
        };
        if *vs == 0 && *vu == 0 {
            *vs = since;
            *vu = until;
        } else {
            *vs = (*vs).min(since);
            *vu = (*vu).max(until);
        }
        *vu = (*vu).min(cap);
    }
}

/// Endpoint comparison where `""` is -∞ for `range_from` (`upper == false`)
/// and +∞ for `range_to` (`upper == true`).
fn range_endpoint_cmp(a: &str, b: &str, upper: bool) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if upper {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, true) => {
            if upper {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, false) => a.cmp(b),
    }
}

// ============================================================================
// Message
// ============================================================================

/// A framed RAINS message: token, sections, optional message signatures and
/// advertised capabilities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub token: Token,
    pub content: Vec<Section>,
    pub signatures: Vec<Signature>,
    pub capabilities: Vec<Capability>,
}

impl Message {
    /// Sort sections by kind, then by each kind's natural keys, sorting
    /// contained content first. Idempotent.
    pub fn sort(&mut self) {
        for section in &mut self.content {
            section.sort();
        }
        self.content.sort_by(|a, b| a.compare_to(b));
    }

    /// A message carrying a single query.
    pub fn query(token: Token, query: Query) -> Self {
        Message {
            token,
            content: vec![Section::Query(query)],
            ..Default::default()
        }
    }

    /// A message carrying a single address query.
    pub fn address_query(token: Token, query: AddressQuery) -> Self {
        Message {
            token,
            content: vec![Section::AddressQuery(query)],
            ..Default::default()
        }
    }

    /// A message carrying one notification that echoes `token`.
    pub fn notification(token: Token, kind: NotificationKind, data: impl Into<String>) -> Self {
        Message {
            token: Token::fresh(),
            content: vec![Section::Notification(Notification {
                token,
                kind,
                data: data.into(),
            })],
            ..Default::default()
        }
    }

    /// A message carrying several notifications. The three input slices
    /// must have equal lengths.
    pub fn notifications(
        tokens: &[Token],
        kinds: &[NotificationKind],
        data: &[String],
    ) -> Result<Self, MessageError> {
        if tokens.len() != kinds.len() || kinds.len() != data.len() {
            return Err(MessageError::MismatchedLengths);
        }
        let content = tokens
            .iter()
            .zip(kinds)
            .zip(data)
            .map(|((token, kind), data)| {
                Section::Notification(Notification {
                    token: *token,
                    kind: *kind,
                    data: data.clone(),
                })
            })
            .collect();
        Ok(Message {
            token: Token::fresh(),
            content,
            ..Default::default()
        })
    }

    /// A fresh delegation query for a zone's key at the given phase.
    pub fn delegation_query(zone: &str, context: &str, expiration: i64) -> Self {
        Message::query(
            Token::fresh(),
            Query {
                name: zone.to_string(),
                context: context.to_string(),
                expiration,
                types: vec![ObjectKind::Delegation],
                options: vec![],
            },
        )
    }
}

/// Error type for message construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Parallel input slices have different lengths.
    MismatchedLengths,
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::MismatchedLengths => write!(f, "input slices have different lengths"),
        }
    }
}

impl std::error::Error for MessageError {}
