//! # Cache Fabric
//!
//! Bounded caches backing the trust engine and the switchboard:
//!
//! | Cache | Key | Value |
//! |-------|-----|-------|
//! | [`ZoneKeyCache`] | (zone, context, phase, algorithm) | public keys with validity |
//! | [`AssertionCache`] | (context, zone, name, object kind) | positive answers |
//! | [`NegAssertionCache`] | (context, zone) | interval map of range proofs |
//! | [`PendingKeyCache`] | (zone, context, phase) | sections parked for a delegation |
//! | [`PendingQueryCache`] | token | origin peers awaiting an upstream answer |
//! | [`CapabilityCache`] | peer / hash | advertised capability lists |
//! | [`ConnectionCache`] | peer | open stream writers |
//!
//! Every cache carries a hard size and a warn size. Insertion beyond the
//! hard size evicts least-recently-used entries until the bound holds
//! again; crossing the warn size emits a telemetry warning. Caches are
//! internally synchronized; locks are never held across I/O.
//!
//! The zone-key, assertion and negative-assertion caches checkpoint to
//! disk as a length-prefixed stream of bincode entries, replaced
//! atomically (write-temp then rename), and restore from the same format
//! on preloaded startup.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::{Assertion, Capability, ObjectKind, Peer, Section, Token};
use crate::signature::{Algorithm, PublicKey};

// ============================================================================
// Bounds and Checkpoint Helpers
// ============================================================================

/// Hard and warn bounds shared by all caches.
#[derive(Clone, Copy, Debug)]
pub struct CacheBounds {
    pub hard: usize,
    pub warn: usize,
}

impl CacheBounds {
    pub fn new(hard: usize, warn: usize) -> Self {
        CacheBounds {
            hard: hard.max(1),
            warn,
        }
    }

    fn check_warn(&self, cache: &'static str, len: usize) {
        if len >= self.warn {
            warn!(cache, len, warn_size = self.warn, "cache at warn size");
        }
    }
}

/// Write `entries` to `path` as a length-prefixed bincode stream,
/// atomically replacing any previous checkpoint.
fn write_checkpoint<T: Serialize>(path: &Path, entries: &[T]) -> anyhow::Result<()> {
    use anyhow::Context as _;
    use std::io::Write as _;

    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
    }
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("creating checkpoint {}", tmp.display()))?;
    for entry in entries {
        let bytes = bincode::serialize(entry).context("encoding checkpoint entry")?;
        file.write_all(&(bytes.len() as u32).to_be_bytes())?;
        file.write_all(&bytes)?;
    }
    file.sync_all()?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replacing checkpoint {}", path.display()))?;
    Ok(())
}

/// Read back a length-prefixed bincode stream written by
/// [`write_checkpoint`]. A missing file restores to empty.
fn read_checkpoint<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    use anyhow::Context as _;
    use std::io::Read as _;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("opening checkpoint {}", path.display())),
    };
    let mut entries = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        entries.push(bincode::deserialize(&payload).context("decoding checkpoint entry")?);
    }
    Ok(entries)
}

// ============================================================================
// Zone-Key Cache
// ============================================================================

/// Identity of a zone key: the tuple trust decisions match on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneKeyId {
    pub zone: String,
    pub context: String,
    pub key_phase: u32,
    pub algorithm: Algorithm,
}

/// Trusted public keys per (zone, context, phase, algorithm) with validity
/// windows. The single source of truth for trust decisions; read-mostly
/// after startup load.
pub struct ZoneKeyCache {
    inner: Mutex<ZoneKeyInner>,
    bounds: CacheBounds,
    max_keys_per_zone: usize,
}

struct ZoneKeyInner {
    keys: LruCache<ZoneKeyId, Vec<PublicKey>>,
    /// Live key count per (zone, context), for classification and the
    /// per-zone limit.
    zone_counts: HashMap<(String, String), usize>,
    total: usize,
}

impl ZoneKeyCache {
    pub fn new(bounds: CacheBounds, max_keys_per_zone: usize) -> Self {
        ZoneKeyCache {
            inner: Mutex::new(ZoneKeyInner {
                keys: LruCache::unbounded(),
                zone_counts: HashMap::new(),
                total: 0,
            }),
            bounds,
            max_keys_per_zone: max_keys_per_zone.max(1),
        }
    }

    /// Add a zone key. Returns false if an identical key was already
    /// present. Enforces the per-zone limit by evicting the soonest
    /// expiring key of that zone, then the global hard bound via LRU.
    pub fn add(&self, zone: &str, context: &str, key: PublicKey) -> bool {
        let id = ZoneKeyId {
            zone: zone.to_string(),
            context: context.to_string(),
            key_phase: key.key_phase,
            algorithm: key.algorithm(),
        };
        let mut inner = self.inner.lock().expect("zone-key cache poisoned");
        let entry = inner.keys.get_or_insert_mut(id, Vec::new);
        if entry.contains(&key) {
            return false;
        }
        entry.push(key);
        inner.total += 1;
        let zone_key = (zone.to_string(), context.to_string());
        let count = inner.zone_counts.entry(zone_key.clone()).or_insert(0);
        *count += 1;
        if *count > self.max_keys_per_zone {
            Self::evict_soonest_expiring(&mut inner, &zone_key);
        }
        while inner.total > self.bounds.hard {
            if let Some((evicted_id, evicted)) = inner.keys.pop_lru() {
                inner.total -= evicted.len();
                Self::decrement_zone(&mut inner.zone_counts, &evicted_id, evicted.len());
            } else {
                break;
            }
        }
        self.bounds.check_warn("zone_keys", inner.total);
        true
    }

    /// Evict the soonest-expiring key belonging to `zone_key`.
    fn evict_soonest_expiring(inner: &mut ZoneKeyInner, zone_key: &(String, String)) {
        let mut victim: Option<(ZoneKeyId, usize, i64)> = None;
        for (id, keys) in inner.keys.iter() {
            if id.zone != zone_key.0 || id.context != zone_key.1 {
                continue;
            }
            for (i, key) in keys.iter().enumerate() {
                if victim.as_ref().map(|(_, _, until)| key.valid_until < *until).unwrap_or(true) {
                    victim = Some((id.clone(), i, key.valid_until));
                }
            }
        }
        if let Some((id, index, _)) = victim {
            if let Some(keys) = inner.keys.peek_mut(&id) {
                keys.remove(index);
                let now_empty = keys.is_empty();
                if now_empty {
                    inner.keys.pop(&id);
                }
            }
            inner.total -= 1;
            Self::decrement_zone(&mut inner.zone_counts, &id, 1);
        }
    }

    fn decrement_zone(
        zone_counts: &mut HashMap<(String, String), usize>,
        id: &ZoneKeyId,
        by: usize,
    ) {
        let key = (id.zone.clone(), id.context.clone());
        if let Some(count) = zone_counts.get_mut(&key) {
            *count = count.saturating_sub(by);
            if *count == 0 {
                zone_counts.remove(&key);
            }
        }
    }

    /// Look up a key for signature verification: the latest-expiring key
    /// of the given identity whose validity window overlaps
    /// `[since, until]`.
    pub fn get(
        &self,
        zone: &str,
        context: &str,
        key_phase: u32,
        algorithm: Algorithm,
        since: i64,
        until: i64,
    ) -> Option<PublicKey> {
        let id = ZoneKeyId {
            zone: zone.to_string(),
            context: context.to_string(),
            key_phase,
            algorithm,
        };
        let mut inner = self.inner.lock().expect("zone-key cache poisoned");
        inner
            .keys
            .get(&id)?
            .iter()
            .filter(|k| k.overlaps(since, until))
            .max_by_key(|k| k.valid_until)
            .cloned()
    }

    /// True if any key for (zone, context) is cached. Used by queue
    /// classification.
    pub fn contains_zone(&self, zone: &str, context: &str) -> bool {
        let inner = self.inner.lock().expect("zone-key cache poisoned");
        inner
            .zone_counts
            .contains_key(&(zone.to_string(), context.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("zone-key cache poisoned").total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop keys whose validity ended before `now`. Returns the number
    /// removed.
    pub fn remove_expired(&self, now: i64) -> usize {
        let mut inner = self.inner.lock().expect("zone-key cache poisoned");
        let ids: Vec<ZoneKeyId> = inner.keys.iter().map(|(id, _)| id.clone()).collect();
        let mut removed = 0;
        for id in ids {
            let Some(keys) = inner.keys.peek_mut(&id) else {
                continue;
            };
            let before = keys.len();
            keys.retain(|k| k.valid_until >= now);
            let dropped = before - keys.len();
            if keys.is_empty() {
                inner.keys.pop(&id);
            }
            if dropped > 0 {
                inner.total -= dropped;
                Self::decrement_zone(&mut inner.zone_counts, &id, dropped);
                removed += dropped;
            }
        }
        removed
    }

    pub fn checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        let entries: Vec<(ZoneKeyId, Vec<PublicKey>)> = {
            let inner = self.inner.lock().expect("zone-key cache poisoned");
            inner
                .keys
                .iter()
                .map(|(id, keys)| (id.clone(), keys.clone()))
                .collect()
        };
        write_checkpoint(path, &entries)
    }

    pub fn restore(&self, path: &Path) -> anyhow::Result<usize> {
        let entries: Vec<(ZoneKeyId, Vec<PublicKey>)> = read_checkpoint(path)?;
        let mut restored = 0;
        for (id, keys) in entries {
            for key in keys {
                if self.add(&id.zone, &id.context, key) {
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }
}

// ============================================================================
// Assertion Cache
// ============================================================================

/// Lookup key for positive answers. An assertion carrying several object
/// kinds is indexed once per kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssertionKey {
    pub context: String,
    pub zone: String,
    pub name: String,
    pub kind: ObjectKind,
}

/// Positive answers admitted by the trust engine.
pub struct AssertionCache {
    inner: Mutex<LruCache<AssertionKey, Vec<Assertion>>>,
    bounds: CacheBounds,
}

impl AssertionCache {
    pub fn new(bounds: CacheBounds) -> Self {
        AssertionCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(bounds.hard).expect("hard bound is non-zero"),
            )),
            bounds,
        }
    }

    /// Admit an assertion under every object kind it carries.
    pub fn add(&self, assertion: &Assertion) {
        let mut kinds: Vec<ObjectKind> = assertion.content.iter().map(|o| o.kind()).collect();
        kinds.sort();
        kinds.dedup();
        let mut inner = self.inner.lock().expect("assertion cache poisoned");
        for kind in kinds {
            let key = AssertionKey {
                context: assertion.context.clone(),
                zone: assertion.subject_zone.clone(),
                name: assertion.subject_name.clone(),
                kind,
            };
            let entry = inner.get_or_insert_mut(key, Vec::new);
            if !entry.contains(assertion) {
                entry.push(assertion.clone());
            }
        }
        self.bounds.check_warn("assertions", inner.len());
    }

    /// Live assertions answering (context, zone, name, kind). Entries past
    /// their validity are skipped unless `expired_ok`.
    pub fn get(
        &self,
        context: &str,
        zone: &str,
        name: &str,
        kind: ObjectKind,
        now: i64,
        expired_ok: bool,
    ) -> Vec<Assertion> {
        let key = AssertionKey {
            context: context.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
            kind,
        };
        let mut inner = self.inner.lock().expect("assertion cache poisoned");
        match inner.get(&key) {
            Some(entries) => entries
                .iter()
                .filter(|a| expired_ok || a.valid_until >= now)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("assertion cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove_expired(&self, now: i64) -> usize {
        let mut inner = self.inner.lock().expect("assertion cache poisoned");
        let keys: Vec<AssertionKey> = inner.iter().map(|(k, _)| k.clone()).collect();
        let mut removed = 0;
        for key in keys {
            let Some(entries) = inner.peek_mut(&key) else {
                continue;
            };
            let before = entries.len();
            entries.retain(|a| a.valid_until >= now);
            removed += before - entries.len();
            if entries.is_empty() {
                inner.pop(&key);
            }
        }
        removed
    }

    pub fn checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        let entries: Vec<(AssertionKey, Vec<Assertion>)> = {
            let inner = self.inner.lock().expect("assertion cache poisoned");
            inner.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        write_checkpoint(path, &entries)
    }

    pub fn restore(&self, path: &Path) -> anyhow::Result<usize> {
        let entries: Vec<(AssertionKey, Vec<Assertion>)> = read_checkpoint(path)?;
        let mut inner = self.inner.lock().expect("assertion cache poisoned");
        let mut restored = 0;
        for (key, assertions) in entries {
            restored += assertions.len();
            inner.put(key, assertions);
        }
        Ok(restored)
    }
}

// ============================================================================
// Negative-Assertion Cache
// ============================================================================

/// One cached range proof: the covering interval plus the section proving
/// it (shard, pshard or whole zone).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RangeProof {
    pub range_from: String,
    pub range_to: String,
    pub section: Section,
}

/// Interval map over `(range_from, range_to)` pairs, ordered by lower
/// endpoint so point lookups scan only candidate intervals.
#[derive(Default, Serialize, Deserialize)]
struct IntervalMap {
    entries: BTreeMap<(String, u64), RangeProof>,
    next_seq: u64,
}

impl IntervalMap {
    fn insert(&mut self, proof: RangeProof) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((proof.range_from.clone(), seq), proof);
    }

    /// All proofs whose interval contains `name`. `""` endpoints are open.
    fn containing(&self, name: &str) -> Vec<&RangeProof> {
        // Lower endpoints are ordered, so everything past `name` is out.
        self.entries
            .range(..=(name.to_string(), u64::MAX))
            .map(|(_, proof)| proof)
            .filter(|p| p.range_to.is_empty() || name < p.range_to.as_str())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, p| p.section.valid_until() >= now);
        before - self.entries.len()
    }
}

/// Range proofs of nonexistence, per (context, zone).
pub struct NegAssertionCache {
    inner: Mutex<LruCache<(String, String), IntervalMap>>,
    bounds: CacheBounds,
}

impl NegAssertionCache {
    pub fn new(bounds: CacheBounds) -> Self {
        NegAssertionCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(bounds.hard).expect("hard bound is non-zero"),
            )),
            bounds,
        }
    }

    /// Admit a proof for (context, zone) covering `[range_from, range_to)`.
    pub fn add(&self, context: &str, zone: &str, proof: RangeProof) {
        let mut inner = self.inner.lock().expect("neg-assertion cache poisoned");
        let map = inner.get_or_insert_mut((context.to_string(), zone.to_string()), IntervalMap::default);
        map.insert(proof);
        let total: usize = inner.iter().map(|(_, m)| m.len()).sum();
        self.bounds.check_warn("negative_assertions", total);
    }

    /// Proofs covering `name` in (context, zone) that are live at `now`.
    pub fn lookup(&self, context: &str, zone: &str, name: &str, now: i64) -> Vec<Section> {
        let mut inner = self.inner.lock().expect("neg-assertion cache poisoned");
        match inner.get(&(context.to_string(), zone.to_string())) {
            Some(map) => map
                .containing(name)
                .into_iter()
                .filter(|p| p.section.valid_until() >= now)
                .map(|p| p.section.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("neg-assertion cache poisoned");
        inner.iter().map(|(_, m)| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove_expired(&self, now: i64) -> usize {
        let mut inner = self.inner.lock().expect("neg-assertion cache poisoned");
        let keys: Vec<(String, String)> = inner.iter().map(|(k, _)| k.clone()).collect();
        let mut removed = 0;
        for key in keys {
            let Some(map) = inner.peek_mut(&key) else {
                continue;
            };
            removed += map.remove_expired(now);
            if map.len() == 0 {
                inner.pop(&key);
            }
        }
        removed
    }

    pub fn checkpoint(&self, path: &Path) -> anyhow::Result<()> {
        let entries: Vec<((String, String), Vec<RangeProof>)> = {
            let inner = self.inner.lock().expect("neg-assertion cache poisoned");
            inner
                .iter()
                .map(|(k, m)| (k.clone(), m.entries.values().cloned().collect()))
                .collect()
        };
        write_checkpoint(path, &entries)
    }

    pub fn restore(&self, path: &Path) -> anyhow::Result<usize> {
        let entries: Vec<((String, String), Vec<RangeProof>)> = read_checkpoint(path)?;
        let mut restored = 0;
        for ((context, zone), proofs) in entries {
            for proof in proofs {
                self.add(&context, &zone, proof);
                restored += 1;
            }
        }
        Ok(restored)
    }
}

// ============================================================================
// Pending-Key Cache
// ============================================================================

/// Identity of an awaited delegation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRequest {
    pub zone: String,
    pub context: String,
    pub key_phase: u32,
}

/// A section parked until its zone key arrives.
#[derive(Clone, Debug)]
pub struct ParkedSection {
    pub section: Section,
    pub sender: Peer,
    pub token: Token,
    pub arrived: i64,
}

struct PendingKeyEntry {
    sections: Vec<ParkedSection>,
    query_token: Token,
    expires: i64,
}

/// Sections blocked on a delegation that has not arrived yet. At most one
/// delegation query is outstanding per key request; `add` hands the caller
/// a fresh token exactly when that query must be sent.
pub struct PendingKeyCache {
    inner: Mutex<PendingKeyInner>,
    bounds: CacheBounds,
}

struct PendingKeyInner {
    entries: HashMap<KeyRequest, PendingKeyEntry>,
    by_token: HashMap<Token, KeyRequest>,
    total: usize,
}

impl PendingKeyCache {
    pub fn new(bounds: CacheBounds) -> Self {
        PendingKeyCache {
            inner: Mutex::new(PendingKeyInner {
                entries: HashMap::new(),
                by_token: HashMap::new(),
                total: 0,
            }),
            bounds,
        }
    }

    /// Park `section` until the key identified by `request` arrives.
    ///
    /// Returns `Some(token)` when this is the first section parked for the
    /// key: the caller must issue a delegation query carrying that token.
    /// Returns `None` when a query is already outstanding, or when the
    /// cache is full and the section was dropped.
    pub fn add(&self, request: KeyRequest, parked: ParkedSection, expires: i64) -> Option<Token> {
        let mut inner = self.inner.lock().expect("pending-key cache poisoned");
        if inner.total >= self.bounds.hard && !inner.entries.contains_key(&request) {
            warn!(
                zone = %request.zone,
                context = %request.context,
                "pending-key cache full, dropping section"
            );
            return None;
        }
        self.bounds.check_warn("pending_keys", inner.total + 1);
        match inner.entries.get_mut(&request) {
            Some(entry) => {
                entry.sections.push(parked);
                inner.total += 1;
                None
            }
            None => {
                let token = Token::fresh();
                inner.entries.insert(
                    request.clone(),
                    PendingKeyEntry {
                        sections: vec![parked],
                        query_token: token,
                        expires,
                    },
                );
                inner.by_token.insert(token, request);
                inner.total += 1;
                Some(token)
            }
        }
    }

    /// The key request a delegation-query token belongs to, if any.
    pub fn request_for_token(&self, token: &Token) -> Option<KeyRequest> {
        let inner = self.inner.lock().expect("pending-key cache poisoned");
        inner.by_token.get(token).cloned()
    }

    /// Release every section parked for `request` (the awaited key has
    /// arrived, or the wait is over).
    pub fn release(&self, request: &KeyRequest) -> Vec<ParkedSection> {
        let mut inner = self.inner.lock().expect("pending-key cache poisoned");
        match inner.entries.remove(request) {
            Some(entry) => {
                inner.by_token.remove(&entry.query_token);
                inner.total -= entry.sections.len();
                entry.sections
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending-key cache poisoned").total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries past their expiration, returning the parked sections
    /// so the caller can notify their senders.
    pub fn remove_expired(&self, now: i64) -> Vec<ParkedSection> {
        let mut inner = self.inner.lock().expect("pending-key cache poisoned");
        let expired: Vec<KeyRequest> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires < now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut dropped = Vec::new();
        for request in expired {
            if let Some(entry) = inner.entries.remove(&request) {
                inner.by_token.remove(&entry.query_token);
                inner.total -= entry.sections.len();
                debug!(zone = %request.zone, context = %request.context, "pending key timed out");
                dropped.extend(entry.sections);
            }
        }
        dropped
    }
}

// ============================================================================
// Pending-Query Cache
// ============================================================================

/// Identity of a forwarded query, used to coalesce duplicate forwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryId {
    pub context: String,
    pub name: String,
    pub types: Vec<ObjectKind>,
}

/// One requester awaiting an answer: the peer and the token it used.
#[derive(Clone, Debug)]
pub struct QueryOrigin {
    pub peer: Peer,
    pub token: Token,
}

struct PendingQueryEntry {
    origins: Vec<QueryOrigin>,
    query_id: QueryId,
    expires: i64,
}

/// Queries forwarded upstream, keyed by the token on the forwarded
/// message. A duplicate query from another origin attaches to the existing
/// entry instead of forwarding again, so each token has at most one
/// outstanding upstream registration.
pub struct PendingQueryCache {
    inner: Mutex<PendingQueryInner>,
    bounds: CacheBounds,
}

struct PendingQueryInner {
    entries: HashMap<Token, PendingQueryEntry>,
    by_query: HashMap<QueryId, Token>,
}

impl PendingQueryCache {
    pub fn new(bounds: CacheBounds) -> Self {
        PendingQueryCache {
            inner: Mutex::new(PendingQueryInner {
                entries: HashMap::new(),
                by_query: HashMap::new(),
            }),
            bounds,
        }
    }

    /// Register `origin` as awaiting an answer for `query_id`.
    ///
    /// Returns `Some(token)` when the query must actually be forwarded
    /// upstream under that fresh token; `None` when an equivalent query is
    /// already in flight (or the cache is full).
    pub fn add(&self, query_id: QueryId, origin: QueryOrigin, expires: i64) -> Option<Token> {
        let mut inner = self.inner.lock().expect("pending-query cache poisoned");
        if let Some(token) = inner.by_query.get(&query_id).copied() {
            if let Some(entry) = inner.entries.get_mut(&token) {
                entry.origins.push(origin);
                return None;
            }
        }
        if inner.entries.len() >= self.bounds.hard {
            warn!(name = %query_id.name, "pending-query cache full, dropping query");
            return None;
        }
        self.bounds.check_warn("pending_queries", inner.entries.len() + 1);
        let token = Token::fresh();
        inner.entries.insert(
            token,
            PendingQueryEntry {
                origins: vec![origin],
                query_id: query_id.clone(),
                expires,
            },
        );
        inner.by_query.insert(query_id, token);
        Some(token)
    }

    /// Resolve the pending entry for `token`, returning the origins to
    /// reply to. `None` means the token is unknown here.
    pub fn remove(&self, token: &Token) -> Option<Vec<QueryOrigin>> {
        let mut inner = self.inner.lock().expect("pending-query cache poisoned");
        let entry = inner.entries.remove(token)?;
        inner.by_query.remove(&entry.query_id);
        Some(entry.origins)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending-query cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries past their expiration, returning their origins so the
    /// caller can notify them.
    pub fn remove_expired(&self, now: i64) -> Vec<QueryOrigin> {
        let mut inner = self.inner.lock().expect("pending-query cache poisoned");
        let expired: Vec<Token> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires < now)
            .map(|(t, _)| *t)
            .collect();
        let mut origins = Vec::new();
        for token in expired {
            if let Some(entry) = inner.entries.remove(&token) {
                inner.by_query.remove(&entry.query_id);
                origins.extend(entry.origins);
            }
        }
        origins
    }
}

// ============================================================================
// Capability Cache
// ============================================================================

/// Advertised peer capabilities, indexed both by peer and by list hash so
/// a hash received in place of a list can resolve.
pub struct CapabilityCache {
    inner: Mutex<CapabilityInner>,
    bounds: CacheBounds,
}

struct CapabilityInner {
    by_peer: LruCache<Peer, Vec<Capability>>,
    by_hash: LruCache<String, Vec<Capability>>,
}

impl CapabilityCache {
    pub fn new(bounds: CacheBounds) -> Self {
        let cap = NonZeroUsize::new(bounds.hard).expect("hard bound is non-zero");
        CapabilityCache {
            inner: Mutex::new(CapabilityInner {
                by_peer: LruCache::new(cap),
                by_hash: LruCache::new(cap),
            }),
            bounds,
        }
    }

    /// Record a full capability list for `peer`, registering its hash.
    pub fn add(&self, peer: Peer, capabilities: Vec<Capability>) {
        let hash = crate::message::capability_hash(&capabilities);
        let mut inner = self.inner.lock().expect("capability cache poisoned");
        inner.by_hash.put(hash, capabilities.clone());
        inner.by_peer.put(peer, capabilities);
        self.bounds.check_warn("capabilities", inner.by_peer.len());
    }

    /// Attach a previously seen list to `peer` by its hash. False if the
    /// hash is unknown (triggering a `CapHashNotKnown` exchange).
    pub fn add_by_hash(&self, peer: Peer, hash: &str) -> bool {
        let mut inner = self.inner.lock().expect("capability cache poisoned");
        match inner.by_hash.get(hash) {
            Some(capabilities) => {
                let capabilities = capabilities.clone();
                inner.by_peer.put(peer, capabilities);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: &Peer) -> Option<Vec<Capability>> {
        let mut inner = self.inner.lock().expect("capability cache poisoned");
        inner.by_peer.get(peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("capability cache poisoned").by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Connection Cache
// ============================================================================

/// Shared writer half of an open stream. Framed writes lock the stream,
/// never the cache.
pub type SharedWriter =
    Arc<tokio::sync::Mutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>>;

/// Handle to one open connection.
#[derive(Clone)]
pub struct ConnHandle {
    pub peer: Peer,
    pub id: u64,
    pub writer: SharedWriter,
}

/// Pool of open stream writers indexed by peer endpoint.
pub struct ConnectionCache {
    inner: Mutex<LruCache<Peer, Vec<ConnHandle>>>,
    next_id: AtomicU64,
    bounds: CacheBounds,
}

impl ConnectionCache {
    pub fn new(bounds: CacheBounds) -> Self {
        ConnectionCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(bounds.hard).expect("hard bound is non-zero"),
            )),
            next_id: AtomicU64::new(1),
            bounds,
        }
    }

    /// Register a stream's writer half for `peer`, returning its handle.
    pub fn add<W>(&self, peer: Peer, writer: W) -> ConnHandle
    where
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let handle = ConnHandle {
            peer,
            id: self.next_id.fetch_add(1, AtomicOrdering::Relaxed),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        };
        let mut inner = self.inner.lock().expect("connection cache poisoned");
        inner.get_or_insert_mut(peer, Vec::new).push(handle.clone());
        self.bounds.check_warn("connections", inner.len());
        handle
    }

    /// All open handles for `peer`, most recently registered first.
    pub fn get(&self, peer: &Peer) -> Vec<ConnHandle> {
        let mut inner = self.inner.lock().expect("connection cache poisoned");
        inner.get(peer).cloned().unwrap_or_default()
    }

    /// Remove one stream from the peer's set (it failed or closed).
    pub fn remove(&self, peer: &Peer, id: u64) {
        let mut inner = self.inner.lock().expect("connection cache poisoned");
        if let Some(handles) = inner.get_mut(peer) {
            handles.retain(|h| h.id != id);
            if handles.is_empty() {
                inner.pop(peer);
            }
        }
    }

    /// Drop every stream registered for `peer`.
    pub fn remove_peer(&self, peer: &Peer) {
        let mut inner = self.inner.lock().expect("connection cache poisoned");
        inner.pop(peer);
    }

    /// Peers with at least one registered stream.
    pub fn peers(&self) -> Vec<Peer> {
        let inner = self.inner.lock().expect("connection cache poisoned");
        inner.iter().map(|(peer, _)| *peer).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("connection cache poisoned");
        inner.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Aggregate
// ============================================================================

/// Every cache the server owns, built from the configured bounds.
pub struct Caches {
    pub zone_keys: ZoneKeyCache,
    pub assertions: AssertionCache,
    pub negatives: NegAssertionCache,
    pub pending_keys: PendingKeyCache,
    pub pending_queries: PendingQueryCache,
    pub capabilities: CapabilityCache,
    pub connections: ConnectionCache,
}
