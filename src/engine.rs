//! # Trust Engine
//!
//! Verifies inbound sections against the zone-key chain, maintains cache
//! validity, answers queries and releases work blocked on missing keys.
//!
//! ## Inbound Pipeline
//!
//! For each signable section, in order:
//!
//! 1. **Sort** contained content into canonical order.
//! 2. **Consistency**: shard content must lie within its range, zone shards
//!    must be non-overlapping and cover the declared range. Violations are
//!    answered with `RcvInconsistentMsg` and nothing is cached.
//! 3. **Key lookup**: each signature needs a zone key matching its
//!    (zone, context, phase, algorithm) with an overlapping validity
//!    window. A missing key parks the section in the pending-key cache and
//!    issues at most one delegation query per awaited key.
//! 4. **Verify**: failed signatures are dropped; a section with no
//!    surviving signature is dropped and logged.
//! 5. **Validity**: the section's window is tightened to the intersection
//!    of signature and key windows, capped per section kind.
//! 6. **Ingest** into the assertion or negative-assertion cache; contained
//!    delegations become zone keys.
//! 7. **Fan-out**: newly cached keys release parked sections (iterated to
//!    fixpoint, since a released section may itself carry delegations),
//!    and pending queries matching the arrival token get their answers.
//!
//! The engine is synchronous: it mutates caches and returns the messages
//! to transmit, so no cache lock is ever held across I/O.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{Caches, KeyRequest, ParkedSection, QueryId, QueryOrigin, RangeProof};
use crate::message::{
    unix_now, AddressQuery, Assertion, Capability, Message, Notification, NotificationKind,
    Object, ObjectKind, Peer, Query, QueryOption, Section, Shard, Subnet, Token, Zone,
    ZoneContent,
};
use crate::signature::PublicKey;

/// Default port assumed when chasing a redirection whose address object
/// carries no port of its own.
const DEFAULT_SERVER_PORT: u16 = 55553;

// ============================================================================
// Configuration
// ============================================================================

/// Per-kind caps on how long a verified section may stay valid, in
/// seconds from now.
#[derive(Clone, Copy, Debug)]
pub struct MaxValidity {
    pub assertion: i64,
    pub shard: i64,
    pub zone: i64,
    pub address_assertion: i64,
    pub address_zone: i64,
}

impl Default for MaxValidity {
    fn default() -> Self {
        // Three days, uniformly.
        let cap = 3 * 24 * 3600;
        MaxValidity {
            assertion: cap,
            shard: cap,
            zone: cap,
            address_assertion: cap,
            address_zone: cap,
        }
    }
}

impl MaxValidity {
    fn for_section(&self, section: &Section) -> i64 {
        match section {
            Section::Assertion(_) => self.assertion,
            Section::Shard(_) => self.shard,
            Section::Zone(_) => self.zone,
            Section::AddressAssertion(_) => self.address_assertion,
            Section::AddressZone(_) => self.address_zone,
            _ => 0,
        }
    }
}

/// Engine knobs bound from server configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_validity: MaxValidity,
    /// Lifetime of delegation queries the engine issues, seconds.
    pub delegation_query_validity: i64,
    /// Lifetime of forwarded queries, seconds.
    pub query_validity: i64,
    /// (zone, context) pairs this server is authoritative for.
    pub authority: HashSet<(String, String)>,
    /// This server's full capability list, re-sent on `CapHashNotKnown`.
    pub capabilities: Vec<Capability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_validity: MaxValidity::default(),
            delegation_query_validity: 5,
            query_validity: 5,
            authority: HashSet::new(),
            capabilities: vec![Capability::tls_over_tcp()],
        }
    }
}

/// A message the engine wants transmitted.
#[derive(Clone, Debug)]
pub struct Outbound {
    pub peer: Peer,
    pub message: Message,
}

// ============================================================================
// Engine
// ============================================================================

pub struct TrustEngine {
    caches: Arc<Caches>,
    config: EngineConfig,
}

impl TrustEngine {
    pub fn new(caches: Arc<Caches>, config: EngineConfig) -> Self {
        TrustEngine { caches, config }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Run one inbound section through the pipeline. Returns the messages
    /// to send in response.
    pub fn process(&self, section: Section, sender: Peer, token: Token) -> Vec<Outbound> {
        let mut out = Vec::new();
        match section {
            Section::Query(query) => self.process_query(query, sender, token, &mut out),
            Section::AddressQuery(query) => {
                self.process_address_query(query, sender, token, &mut out)
            }
            Section::Notification(notification) => {
                self.process_notification(notification, sender, &mut out)
            }
            signable => self.process_signable(signable, sender, token, &mut out),
        }
        out
    }

    // ------------------------------------------------------------------
    // Signable sections
    // ------------------------------------------------------------------

    fn process_signable(
        &self,
        mut section: Section,
        sender: Peer,
        token: Token,
        out: &mut Vec<Outbound>,
    ) {
        section.sort();

        if let Err(detail) = check_consistency(&section) {
            info!(%sender, %detail, "inconsistent section");
            out.push(Outbound {
                peer: sender,
                message: Message::notification(token, NotificationKind::RcvInconsistentMsg, detail),
            });
            return;
        }

        let verified = match self.verify(&mut section, sender, token, out) {
            Verification::Verified => true,
            Verification::Parked | Verification::Dropped => false,
        };
        if !verified {
            return;
        }

        self.ingest(&section, out);

        // A pending query waiting on this token gets the section as its answer.
        if let Some(origins) = self.caches.pending_queries.remove(&token) {
            for origin in origins {
                out.push(Outbound {
                    peer: origin.peer,
                    message: Message {
                        token: origin.token,
                        content: vec![section.clone()],
                        ..Default::default()
                    },
                });
            }
        }
    }

    fn verify(
        &self,
        section: &mut Section,
        sender: Peer,
        token: Token,
        out: &mut Vec<Outbound>,
    ) -> Verification {
        let context = section.context().unwrap_or_default().to_string();
        let zone = section.subject_zone().unwrap_or_default().to_string();
        let signatures = match section.signatures() {
            Some(sigs) if !sigs.is_empty() => sigs.to_vec(),
            _ => {
                debug!(%sender, %zone, "dropping unsigned section");
                return Verification::Dropped;
            }
        };

        // Locate a key for every signature before touching the primitives.
        let mut keys: Vec<PublicKey> = Vec::with_capacity(signatures.len());
        for sig in &signatures {
            match self.caches.zone_keys.get(
                &zone,
                &context,
                sig.key_phase,
                sig.algorithm,
                sig.valid_since,
                sig.valid_until,
            ) {
                Some(key) => keys.push(key),
                None => {
                    self.park(section.clone(), &zone, &context, sig.key_phase, sender, token, out);
                    return Verification::Parked;
                }
            }
        }

        let canonical = crate::canonical::encode_section(section);
        let now = unix_now();
        let max_validity = self.config.max_validity.for_section(section);
        let mut survivors = Vec::new();
        let mut windows = Vec::new();
        for (sig, key) in signatures.into_iter().zip(keys) {
            if sig.valid_until < now {
                debug!(%sender, %zone, "dropping expired signature");
                continue;
            }
            if sig.verify(&key, &canonical) {
                windows.push((
                    sig.valid_since.max(key.valid_since),
                    sig.valid_until.min(key.valid_until),
                ));
                survivors.push(sig);
            } else {
                warn!(%sender, %zone, "dropping signature that failed verification");
            }
        }

        if survivors.is_empty() {
            warn!(%sender, %zone, "dropping section with no valid signature");
            return Verification::Dropped;
        }
        if let Some(sigs) = section.signatures_mut() {
            *sigs = survivors;
        }
        for (since, until) in windows {
            section.update_validity(since, until, max_validity);
        }
        Verification::Verified
    }

    /// Park a section awaiting a zone key, issuing the delegation query if
    /// none is outstanding for that key yet.
    fn park(
        &self,
        section: Section,
        zone: &str,
        context: &str,
        key_phase: u32,
        sender: Peer,
        token: Token,
        out: &mut Vec<Outbound>,
    ) {
        let request = KeyRequest {
            zone: zone.to_string(),
            context: context.to_string(),
            key_phase,
        };
        let now = unix_now();
        let parked = ParkedSection {
            section,
            sender,
            token,
            arrived: now,
        };
        if let Some(query_token) = self.caches.pending_keys.add(
            request,
            parked,
            now + self.config.delegation_query_validity,
        ) {
            debug!(zone, context, key_phase, "issuing delegation query");
            let mut msg = Message::delegation_query(
                zone,
                context,
                now + self.config.delegation_query_validity,
            );
            msg.token = query_token;
            out.push(Outbound {
                peer: sender,
                message: msg,
            });
        }
    }

    // ------------------------------------------------------------------
    // Ingest and fan-out
    // ------------------------------------------------------------------

    fn ingest(&self, section: &Section, out: &mut Vec<Outbound>) {
        match section {
            Section::Assertion(assertion) => self.ingest_assertion(assertion, out),
            Section::Shard(shard) => {
                self.caches.negatives.add(
                    &shard.context,
                    &shard.subject_zone,
                    RangeProof {
                        range_from: shard.range_from.clone(),
                        range_to: shard.range_to.clone(),
                        section: section.clone(),
                    },
                );
                for assertion in &shard.content {
                    let mut inherited = assertion.clone();
                    inherited.valid_since = shard.valid_since;
                    inherited.valid_until = shard.valid_until;
                    self.ingest_assertion(&inherited, out);
                }
            }
            Section::Zone(zone) => {
                self.caches.negatives.add(
                    &zone.context,
                    &zone.subject_zone,
                    RangeProof {
                        range_from: String::new(),
                        range_to: String::new(),
                        section: section.clone(),
                    },
                );
                for content in &zone.content {
                    match content {
                        ZoneContent::Assertion(assertion) => {
                            let mut inherited = assertion.clone();
                            inherited.valid_since = zone.valid_since;
                            inherited.valid_until = zone.valid_until;
                            self.ingest_assertion(&inherited, out);
                        }
                        ZoneContent::Shard(shard) => {
                            let mut inherited = shard.clone();
                            inherited.valid_since = zone.valid_since;
                            inherited.valid_until = zone.valid_until;
                            let proof = Section::Shard(inherited.clone());
                            self.caches.negatives.add(
                                &shard.context,
                                &shard.subject_zone,
                                RangeProof {
                                    range_from: shard.range_from.clone(),
                                    range_to: shard.range_to.clone(),
                                    section: proof,
                                },
                            );
                            for assertion in &inherited.content {
                                let mut a = assertion.clone();
                                a.valid_since = inherited.valid_since;
                                a.valid_until = inherited.valid_until;
                                self.ingest_assertion(&a, out);
                            }
                        }
                        ZoneContent::Pshard(pshard) => {
                            self.caches.negatives.add(
                                &pshard.context,
                                &pshard.subject_zone,
                                RangeProof {
                                    range_from: pshard.range_from.clone(),
                                    range_to: pshard.range_to.clone(),
                                    section: section.clone(),
                                },
                            );
                        }
                    }
                }
            }
            Section::AddressAssertion(a) => {
                // No address cache is configured; verified address sections
                // only serve token-matched pending queries.
                debug!(subnet = %a.subject_addr, "verified address assertion");
            }
            Section::AddressZone(z) => {
                debug!(subnet = %z.subject_addr, "verified address zone");
            }
            _ => {}
        }
    }

    fn ingest_assertion(&self, assertion: &Assertion, out: &mut Vec<Outbound>) {
        self.caches.assertions.add(assertion);
        // Delegations convey child zone keys; adding one may unblock
        // sections parked for it, which are re-run through the pipeline.
        for object in &assertion.content {
            if let Object::Delegation(key) = object {
                let delegated = child_zone(&assertion.subject_name, &assertion.subject_zone);
                if self.caches.zone_keys.add(&delegated, &assertion.context, key.clone()) {
                    debug!(zone = %delegated, phase = key.key_phase, "cached delegated zone key");
                }
                let released = self.caches.pending_keys.release(&KeyRequest {
                    zone: delegated.clone(),
                    context: assertion.context.clone(),
                    key_phase: key.key_phase,
                });
                for parked in released {
                    debug!(zone = %delegated, "re-verifying released section");
                    self.process_signable(parked.section, parked.sender, parked.token, out);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn process_query(&self, query: Query, sender: Peer, token: Token, out: &mut Vec<Outbound>) {
        let now = unix_now();
        if query.expiration < now {
            debug!(%sender, name = %query.name, "dropping expired query");
            return;
        }

        let expired_ok = query.has_option(QueryOption::ExpiredAssertionsOk);
        let mut answers: Vec<Section> = Vec::new();
        for kind in &query.types {
            for (name, zone) in name_splits(&query.name) {
                let found =
                    self.caches
                        .assertions
                        .get(&query.context, &zone, &name, *kind, now, expired_ok);
                if !found.is_empty() {
                    answers.extend(found.into_iter().map(Section::Assertion));
                    break;
                }
            }
        }
        if !answers.is_empty() {
            out.push(Outbound {
                peer: sender,
                message: Message {
                    token,
                    content: answers,
                    ..Default::default()
                },
            });
            return;
        }

        // Negative proof: any cached range containing the queried name.
        for (name, zone) in name_splits(&query.name) {
            let proofs = self.caches.negatives.lookup(&query.context, &zone, &name, now);
            if !proofs.is_empty() {
                out.push(Outbound {
                    peer: sender,
                    message: Message {
                        token,
                        content: proofs,
                        ..Default::default()
                    },
                });
                return;
            }
        }

        if query.has_option(QueryOption::CachedAnswersOnly) {
            out.push(Outbound {
                peer: sender,
                message: Message::notification(token, NotificationKind::NoAssertionAvail, ""),
            });
            return;
        }

        // Authoritative for the name's zone with nothing cached: the data
        // does not exist here.
        if self.is_authoritative(&query.name, &query.context) {
            out.push(Outbound {
                peer: sender,
                message: Message::notification(token, NotificationKind::NoAssertionsExist, ""),
            });
            return;
        }

        self.forward_query(query, sender, token, out);
    }

    fn process_address_query(
        &self,
        query: AddressQuery,
        sender: Peer,
        token: Token,
        out: &mut Vec<Outbound>,
    ) {
        let now = unix_now();
        if query.expiration < now {
            debug!(%sender, subnet = %query.subject_addr, "dropping expired address query");
            return;
        }
        // Address data is not cached locally; without an upstream to chase
        // the only honest answer is that none is available.
        out.push(Outbound {
            peer: sender,
            message: Message::notification(token, NotificationKind::NoAssertionAvail, ""),
        });
    }

    /// Park the query and forward it upstream when a redirection for the
    /// zone resolves to an address; otherwise report `NoAssertionAvail`.
    fn forward_query(&self, query: Query, sender: Peer, token: Token, out: &mut Vec<Outbound>) {
        let now = unix_now();
        let Some(upstream) = self.resolve_upstream(&query.name, &query.context, now) else {
            debug!(name = %query.name, "no upstream for unresolvable query");
            out.push(Outbound {
                peer: sender,
                message: Message::notification(token, NotificationKind::NoAssertionAvail, ""),
            });
            return;
        };

        let query_id = QueryId {
            context: query.context.clone(),
            name: query.name.clone(),
            types: query.types.clone(),
        };
        let origin = QueryOrigin { peer: sender, token };
        let expires = now + self.config.query_validity;
        if let Some(fresh) = self.caches.pending_queries.add(query_id, origin, expires) {
            let mut forwarded = query;
            forwarded.expiration = expires;
            out.push(Outbound {
                peer: upstream,
                message: Message::query(fresh, forwarded),
            });
        }
    }

    /// Chase a cached redirection for the queried name's zone to an
    /// address object.
    fn resolve_upstream(&self, name: &str, context: &str, now: i64) -> Option<Peer> {
        for (_, zone) in name_splits(name) {
            let redirects =
                self.caches
                    .assertions
                    .get(context, &zone, "@redir", ObjectKind::Redirection, now, false);
            let mut targets: Vec<String> = Vec::new();
            for assertion in &redirects {
                for object in assertion.objects_of_kind(ObjectKind::Redirection) {
                    if let Object::Redirection(target) = object {
                        targets.push(target.clone());
                    }
                }
            }
            for target in targets {
                for (tname, tzone) in name_splits(&target) {
                    for assertion in self.caches.assertions.get(
                        context,
                        &tzone,
                        &tname,
                        ObjectKind::Ip4,
                        now,
                        false,
                    ) {
                        for object in assertion.objects_of_kind(ObjectKind::Ip4) {
                            if let Object::Ip4(ip) = object {
                                return Some(Peer::tcp(SocketAddr::new(
                                    IpAddr::V4(*ip),
                                    DEFAULT_SERVER_PORT,
                                )));
                            }
                        }
                    }
                }
            }
        }
        None
    }

    fn is_authoritative(&self, name: &str, context: &str) -> bool {
        name_splits(name).iter().any(|(_, zone)| {
            self.config
                .authority
                .contains(&(zone.clone(), context.to_string()))
        })
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn process_notification(
        &self,
        notification: Notification,
        sender: Peer,
        out: &mut Vec<Outbound>,
    ) {
        match notification.kind {
            NotificationKind::Heartbeat => {}
            NotificationKind::CapHashNotKnown => {
                // The peer could not resolve our capability hash: answer
                // with the full list.
                debug!(%sender, "peer requests full capability list");
                let mut msg = Message::notification(
                    notification.token,
                    NotificationKind::CapHashNotKnown,
                    capability_list_string(&self.config.capabilities),
                );
                msg.capabilities = self.config.capabilities.clone();
                out.push(Outbound {
                    peer: sender,
                    message: msg,
                });
            }
            NotificationKind::NoAssertionsExist | NotificationKind::NoAssertionAvail => {
                // Negative answer from upstream: relay to everyone waiting
                // on this token.
                match self.caches.pending_queries.remove(&notification.token) {
                    Some(origins) => {
                        for origin in origins {
                            out.push(Outbound {
                                peer: origin.peer,
                                message: Message::notification(
                                    origin.token,
                                    notification.kind,
                                    notification.data.clone(),
                                ),
                            });
                        }
                    }
                    None => {
                        debug!(%sender, token = %notification.token, "notification for unknown token");
                    }
                }
            }
            NotificationKind::BadMessage
            | NotificationKind::RcvInconsistentMsg
            | NotificationKind::MsgTooLarge
            | NotificationKind::UnspecServerErr
            | NotificationKind::ServerNotCapable => {
                warn!(%sender, kind = ?notification.kind, data = %notification.data, "peer reported an error");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reaping support
    // ------------------------------------------------------------------

    /// Age out pending entries, producing the `NoAssertionAvail`
    /// notifications owed to the blocked requesters.
    pub fn reap_pending(&self, now: i64) -> Vec<Outbound> {
        let mut out = Vec::new();
        for parked in self.caches.pending_keys.remove_expired(now) {
            out.push(Outbound {
                peer: parked.sender,
                message: Message::notification(parked.token, NotificationKind::NoAssertionAvail, ""),
            });
        }
        for origin in self.caches.pending_queries.remove_expired(now) {
            out.push(Outbound {
                peer: origin.peer,
                message: Message::notification(origin.token, NotificationKind::NoAssertionAvail, ""),
            });
        }
        out
    }
}

enum Verification {
    Verified,
    Parked,
    Dropped,
}

// ============================================================================
// Consistency
// ============================================================================

/// Structural consistency of a sorted signable section.
fn check_consistency(section: &Section) -> Result<(), String> {
    match section {
        Section::Shard(shard) => check_shard(shard),
        Section::Zone(zone) => check_zone(zone),
        Section::AddressZone(zone) => {
            for assertion in &zone.content {
                if assertion.context != zone.context {
                    return Err("address assertion context differs from zone".to_string());
                }
                if !subnet_contains(&zone.subject_addr, &assertion.subject_addr) {
                    return Err(format!(
                        "address assertion {} outside zone {}",
                        assertion.subject_addr, zone.subject_addr
                    ));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_shard(shard: &Shard) -> Result<(), String> {
    if !shard.range_from.is_empty()
        && !shard.range_to.is_empty()
        && shard.range_from >= shard.range_to
    {
        return Err(format!(
            "shard range [{}, {}) is empty",
            shard.range_from, shard.range_to
        ));
    }
    for assertion in &shard.content {
        if assertion.subject_zone != shard.subject_zone || assertion.context != shard.context {
            return Err(format!(
                "assertion {} scoped outside its shard",
                assertion.subject_name
            ));
        }
        if !shard.in_range(&assertion.subject_name) {
            return Err(format!(
                "assertion {} outside shard range [{}, {})",
                assertion.subject_name, shard.range_from, shard.range_to
            ));
        }
    }
    Ok(())
}

fn check_zone(zone: &Zone) -> Result<(), String> {
    let mut shards: Vec<&Shard> = Vec::new();
    for content in &zone.content {
        match content {
            ZoneContent::Assertion(a) => {
                if a.subject_zone != zone.subject_zone || a.context != zone.context {
                    return Err(format!("assertion {} scoped outside its zone", a.subject_name));
                }
            }
            ZoneContent::Shard(s) => {
                if s.subject_zone != zone.subject_zone || s.context != zone.context {
                    return Err("shard scoped outside its zone".to_string());
                }
                check_shard(s)?;
                shards.push(s);
            }
            ZoneContent::Pshard(p) => {
                if p.subject_zone != zone.subject_zone || p.context != zone.context {
                    return Err("pshard scoped outside its zone".to_string());
                }
            }
        }
    }

    // Sorted zone content keeps shards in range order: adjacent shards
    // must meet exactly, and the whole sequence must span the namespace.
    if !shards.is_empty() {
        if !shards[0].range_from.is_empty() {
            return Err("zone shards do not cover the lower end".to_string());
        }
        if !shards[shards.len() - 1].range_to.is_empty() {
            return Err("zone shards do not cover the upper end".to_string());
        }
        for pair in shards.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            if left.range_to.is_empty() || right.range_from.is_empty() {
                return Err("zone shards overlap".to_string());
            }
            match left.range_to.cmp(&right.range_from) {
                std::cmp::Ordering::Less => {
                    return Err(format!(
                        "zone shards leave a gap between {} and {}",
                        left.range_to, right.range_from
                    ));
                }
                std::cmp::Ordering::Greater => return Err("zone shards overlap".to_string()),
                std::cmp::Ordering::Equal => {}
            }
        }
    }
    Ok(())
}

fn subnet_contains(outer: &Subnet, inner: &Subnet) -> bool {
    if outer.prefix_len > inner.prefix_len {
        return false;
    }
    match (outer.addr, inner.addr) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let bits = u32::from(outer.prefix_len).min(32);
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(a) & mask) == (u32::from(b) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let bits = u32::from(outer.prefix_len).min(128);
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(a) & mask) == (u128::from(b) & mask)
        }
        _ => false,
    }
}

/// The zone a delegation assertion conveys a key for: the subject name
/// appended to its zone, with the root written as `.`.
fn child_zone(subject_name: &str, subject_zone: &str) -> String {
    if subject_zone == "." || subject_zone.is_empty() {
        subject_name.to_string()
    } else {
        format!("{subject_name}.{subject_zone}")
    }
}

/// Candidate (subject, zone) splits of a fully qualified name, most
/// specific zone first, ending with the root split.
fn name_splits(name: &str) -> Vec<(String, String)> {
    let mut splits = Vec::new();
    let mut index = 0;
    while let Some(dot) = name[index..].find('.') {
        let at = index + dot;
        let subject = &name[..at];
        let zone = &name[at + 1..];
        if !subject.is_empty() && !zone.is_empty() {
            splits.push((subject.to_string(), zone.to_string()));
        }
        index = at + 1;
    }
    splits.push((name.to_string(), ".".to_string()));
    splits
}

/// The capability list as a space-joined string, carried in
/// `CapHashNotKnown` notification data.
fn capability_list_string(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{
        AssertionCache, CacheBounds, CapabilityCache, ConnectionCache, NegAssertionCache,
        PendingKeyCache, PendingQueryCache, ZoneKeyCache,
    };
    use crate::signature::{Algorithm, PrivateKey, Signature};
    use std::net::Ipv4Addr;

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

    fn engine() -> TrustEngine {
        TrustEngine::new(test_caches(), EngineConfig::default())
    }

    fn peer(port: u16) -> Peer {
        Peer::tcp(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Sign `section` with `key` under (phase 1, window now±1h).
    fn sign_section(section: &mut Section, key: &PrivateKey) {
        let now = unix_now();
        let mut sig = Signature::new(key.algorithm(), 1, now - 3600, now + 3600);
        let canonical = crate::canonical::encode_section(section);
        sig.sign(key, &canonical).unwrap();
        section.signatures_mut().unwrap().push(sig);
    }

    fn delegation_assertion(zone: &str, name: &str, delegated_key: &PublicKey) -> Assertion {
        Assertion {
            subject_name: name.to_string(),
            subject_zone: zone.to_string(),
            context: ".".to_string(),
            content: vec![Object::Delegation(delegated_key.clone())],
            ..Default::default()
        }
    }

    fn ip_assertion(zone: &str, name: &str) -> Assertion {
        Assertion {
            subject_name: name.to_string(),
            subject_zone: zone.to_string(),
            context: ".".to_string(),
            content: vec![Object::Ip4(Ipv4Addr::new(192, 0, 2, 9))],
            ..Default::default()
        }
    }

    #[test]
    fn happy_assertion_is_admitted_and_answerable() {
        let engine = engine();
        let now = unix_now();

        // Root key trusted out of band.
        let root = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add(".", ".", root.public_key(1, now - 10, now + 7200));

        // "." asserts the delegation for "ch".
        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        let ch_pub = ch.public_key(1, now - 10, now + 7200);
        let mut section = Section::Assertion(delegation_assertion(".", "ch", &ch_pub));
        sign_section(&mut section, &root);

        let out = engine.process(section, peer(1000), Token::fresh());
        assert!(out.is_empty(), "no reply expected: {out:?}");
        assert!(engine.caches.zone_keys.contains_zone("ch", "."));

        // The delegation is now answerable from cache.
        let query = Query {
            name: "ch".to_string(),
            context: ".".to_string(),
            expiration: now + 60,
            types: vec![ObjectKind::Delegation],
            options: vec![],
        };
        let token = Token::fresh();
        let replies = engine.process(Section::Query(query), peer(1001), token);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message.token, token);
        match &replies[0].message.content[0] {
            Section::Assertion(a) => {
                assert_eq!(a.subject_name, "ch");
                assert!(matches!(a.content[0], Object::Delegation(_)));
            }
            other => panic!("expected assertion, got {other:?}"),
        }
    }

    #[test]
    fn deferred_key_parks_then_releases() {
        let engine = engine();
        let now = unix_now();

        let root = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add(".", ".", root.public_key(1, now - 10, now + 7200));

        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        let ch_pub = ch.public_key(1, now - 10, now + 7200);

        // An assertion for zone "ch" arrives before the "ch" delegation.
        let mut early = Section::Assertion(ip_assertion("ch", "example"));
        sign_section(&mut early, &ch);
        let sender = peer(2000);
        let out = engine.process(early, sender, Token::fresh());

        // Parked, and exactly one delegation query went out.
        assert_eq!(engine.caches.pending_keys.len(), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].peer, sender);
        match &out[0].message.content[0] {
            Section::Query(q) => {
                assert_eq!(q.name, "ch");
                assert_eq!(q.types, vec![ObjectKind::Delegation]);
            }
            other => panic!("expected delegation query, got {other:?}"),
        }

        // A second section for the same missing key does not re-query.
        let mut second = Section::Assertion(ip_assertion("ch", "other"));
        sign_section(&mut second, &ch);
        let out2 = engine.process(second, sender, Token::fresh());
        assert!(out2.is_empty());
        assert_eq!(engine.caches.pending_keys.len(), 2);

        // The delegation arrives; parked sections verify and land in cache.
        let mut delegation = Section::Assertion(delegation_assertion(".", "ch", &ch_pub));
        sign_section(&mut delegation, &root);
        let out3 = engine.process(delegation, peer(2001), Token::fresh());
        assert!(out3.is_empty(), "unexpected replies: {out3:?}");
        assert!(engine.caches.pending_keys.is_empty());
        assert!(!engine
            .caches
            .assertions
            .get(".", "ch", "example", ObjectKind::Ip4, now, false)
            .is_empty());
        assert!(!engine
            .caches
            .assertions
            .get(".", "ch", "other", ObjectKind::Ip4, now, false)
            .is_empty());
    }

    #[test]
    fn inconsistent_shard_rejected_without_cache_mutation() {
        let engine = engine();
        let now = unix_now();
        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add("ch", ".", ch.public_key(1, now - 10, now + 7200));

        let shard = Shard {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            range_from: "b".to_string(),
            range_to: "d".to_string(),
            content: vec![ip_assertion("ch", "z")],
            ..Default::default()
        };
        let mut section = Section::Shard(shard);
        sign_section(&mut section, &ch);

        let token = Token::fresh();
        let out = engine.process(section, peer(3000), token);
        assert_eq!(out.len(), 1);
        match &out[0].message.content[0] {
            Section::Notification(n) => {
                assert_eq!(n.kind, NotificationKind::RcvInconsistentMsg);
                assert_eq!(n.token, token);
            }
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(engine.caches.negatives.is_empty());
        assert!(engine.caches.assertions.is_empty());
    }

    #[test]
    fn forged_signature_drops_section() {
        let engine = engine();
        let now = unix_now();
        let genuine = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        let imposter = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add("ch", ".", genuine.public_key(1, now - 10, now + 7200));

        let mut section = Section::Assertion(ip_assertion("ch", "example"));
        sign_section(&mut section, &imposter);

        let out = engine.process(section, peer(3100), Token::fresh());
        assert!(out.is_empty());
        assert!(engine.caches.assertions.is_empty());
    }

    #[test]
    fn admitted_validity_is_capped() {
        let mut config = EngineConfig::default();
        config.max_validity.assertion = 100;
        let engine = TrustEngine::new(test_caches(), config);
        let now = unix_now();

        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add("ch", ".", ch.public_key(1, now - 10, now + 1_000_000));

        let mut section = Section::Assertion(ip_assertion("ch", "example"));
        let mut sig = Signature::new(Algorithm::Ed25519, 1, now - 10, now + 1_000_000);
        let canonical = crate::canonical::encode_section(&section);
        sig.sign(&ch, &canonical).unwrap();
        section.signatures_mut().unwrap().push(sig);

        engine.process(section, peer(3200), Token::fresh());
        let cached = engine
            .caches
            .assertions
            .get(".", "ch", "example", ObjectKind::Ip4, now, false);
        assert_eq!(cached.len(), 1);
        assert!(cached[0].valid_until <= now + 101, "validity not capped");
        assert!(cached[0].valid_until >= now, "validity in the past");
    }

    #[test]
    fn cached_answers_only_miss_yields_no_assertion_avail() {
        let engine = engine();
        let query = Query {
            name: "missing.ch".to_string(),
            context: ".".to_string(),
            expiration: unix_now() + 60,
            types: vec![ObjectKind::Ip4],
            options: vec![QueryOption::CachedAnswersOnly],
        };
        let token = Token::fresh();
        let out = engine.process(Section::Query(query), peer(4000), token);
        assert_eq!(out.len(), 1);
        match &out[0].message.content[0] {
            Section::Notification(n) => {
                assert_eq!(n.kind, NotificationKind::NoAssertionAvail);
                assert_eq!(n.token, token);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn authoritative_miss_yields_no_assertions_exist() {
        let mut config = EngineConfig::default();
        config.authority.insert(("ch".to_string(), ".".to_string()));
        let engine = TrustEngine::new(test_caches(), config);

        let query = Query {
            name: "missing.ch".to_string(),
            context: ".".to_string(),
            expiration: unix_now() + 60,
            types: vec![ObjectKind::Ip4],
            options: vec![],
        };
        let out = engine.process(Section::Query(query), peer(4100), Token::fresh());
        assert_eq!(out.len(), 1);
        match &out[0].message.content[0] {
            Section::Notification(n) => assert_eq!(n.kind, NotificationKind::NoAssertionsExist),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn negative_proof_answers_query() {
        let engine = engine();
        let now = unix_now();
        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add("ch", ".", ch.public_key(1, now - 10, now + 7200));

        let shard = Shard {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            range_from: "a".to_string(),
            range_to: "m".to_string(),
            content: vec![],
            ..Default::default()
        };
        let mut section = Section::Shard(shard);
        sign_section(&mut section, &ch);
        engine.process(section, peer(4200), Token::fresh());

        let query = Query {
            name: "gone.ch".to_string(),
            context: ".".to_string(),
            expiration: now + 60,
            types: vec![ObjectKind::Ip4],
            options: vec![],
        };
        let token = Token::fresh();
        let out = engine.process(Section::Query(query), peer(4201), token);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message.content[0], Section::Shard(_)));
    }

    #[test]
    fn query_forwarded_via_redirect_and_answer_fans_out() {
        let engine = engine();
        let now = unix_now();
        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add("ch", ".", ch.public_key(1, now - 10, now + 7200));

        // Seed a redirection for "ch" and the address of its target.
        let mut redir = Section::Assertion(Assertion {
            subject_name: "@redir".to_string(),
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![Object::Redirection("ns1.ch".to_string())],
            ..Default::default()
        });
        sign_section(&mut redir, &ch);
        engine.process(redir, peer(4300), Token::fresh());
        let mut ns_addr = Section::Assertion(ip_assertion("ch", "ns1"));
        sign_section(&mut ns_addr, &ch);
        engine.process(ns_addr, peer(4300), Token::fresh());

        // A miss for a "ch" name forwards upstream under a fresh token.
        let query = Query {
            name: "unknown.ch".to_string(),
            context: ".".to_string(),
            expiration: now + 60,
            types: vec![ObjectKind::Ip6],
            options: vec![],
        };
        let origin_token = Token::fresh();
        let origin = peer(4301);
        let out = engine.process(Section::Query(query.clone()), origin, origin_token);
        assert_eq!(out.len(), 1);
        let upstream_token = out[0].message.token;
        assert_ne!(upstream_token, origin_token);
        assert_eq!(engine.caches.pending_queries.len(), 1);

        // A duplicate query from elsewhere coalesces.
        let out2 = engine.process(Section::Query(query), peer(4302), Token::fresh());
        assert!(out2.is_empty());

        // The upstream answer arrives under the forwarded token and fans
        // out to both origins.
        let mut answer = Section::Assertion(Assertion {
            subject_name: "unknown".to_string(),
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![Object::Ip6("2001:db8::1".parse().unwrap())],
            ..Default::default()
        });
        sign_section(&mut answer, &ch);
        let replies = engine.process(answer, peer(4303), upstream_token);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().any(|r| r.peer == origin && r.message.token == origin_token));
        assert!(engine.caches.pending_queries.is_empty());
    }

    #[test]
    fn upstream_negative_notification_fans_out() {
        let engine = engine();
        let now = unix_now();
        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        engine
            .caches
            .zone_keys
            .add("ch", ".", ch.public_key(1, now - 10, now + 7200));
        let mut redir = Section::Assertion(Assertion {
            subject_name: "@redir".to_string(),
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![Object::Redirection("ns1.ch".to_string())],
            ..Default::default()
        });
        sign_section(&mut redir, &ch);
        engine.process(redir, peer(4400), Token::fresh());
        let mut ns_addr = Section::Assertion(ip_assertion("ch", "ns1"));
        sign_section(&mut ns_addr, &ch);
        engine.process(ns_addr, peer(4400), Token::fresh());

        let origin_token = Token::fresh();
        let out = engine.process(
            Section::Query(Query {
                name: "nope.ch".to_string(),
                context: ".".to_string(),
                expiration: now + 60,
                types: vec![ObjectKind::Ip4],
                options: vec![],
            }),
            peer(4401),
            origin_token,
        );
        let upstream_token = out[0].message.token;

        let replies = engine.process(
            Section::Notification(Notification {
                token: upstream_token,
                kind: NotificationKind::NoAssertionsExist,
                data: String::new(),
            }),
            peer(4402),
            Token::fresh(),
        );
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].peer, peer(4401));
        match &replies[0].message.content[0] {
            Section::Notification(n) => {
                assert_eq!(n.kind, NotificationKind::NoAssertionsExist);
                assert_eq!(n.token, origin_token);
            }
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(engine.caches.pending_queries.is_empty());
    }

    #[test]
    fn cap_hash_not_known_resends_full_list() {
        let engine = engine();
        let out = engine.process(
            Section::Notification(Notification {
                token: Token::fresh(),
                kind: NotificationKind::CapHashNotKnown,
                data: String::new(),
            }),
            peer(4500),
            Token::fresh(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.capabilities, vec![Capability::tls_over_tcp()]);
    }

    #[test]
    fn reap_pending_notifies_blocked_requesters() {
        let engine = engine();
        let now = unix_now();

        // Park a section for a key that will never arrive.
        let ch = PrivateKey::generate(Algorithm::Ed25519).unwrap();
        let mut section = Section::Assertion(ip_assertion("ch", "example"));
        sign_section(&mut section, &ch);
        let sender = peer(4600);
        engine.process(section, sender, Token::fresh());
        assert_eq!(engine.caches.pending_keys.len(), 1);

        let notifications = engine.reap_pending(now + 1_000_000);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].peer, sender);
        match &notifications[0].message.content[0] {
            Section::Notification(n) => assert_eq!(n.kind, NotificationKind::NoAssertionAvail),
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(engine.caches.pending_keys.is_empty());
    }

    #[test]
    fn zone_shard_coverage_check() {
        let covered = Zone {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    range_from: String::new(),
                    range_to: "m".to_string(),
                    ..Default::default()
                }),
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    range_from: "m".to_string(),
                    range_to: String::new(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        };
        assert!(check_consistency(&Section::Zone(covered)).is_ok());

        let gap = Zone {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    range_from: String::new(),
                    range_to: "f".to_string(),
                    ..Default::default()
                }),
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    range_from: "m".to_string(),
                    range_to: String::new(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        };
        assert!(check_consistency(&Section::Zone(gap)).is_err());

        let overlap = Zone {
            subject_zone: "ch".to_string(),
            context: ".".to_string(),
            content: vec![
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    range_from: String::new(),
                    range_to: "m".to_string(),
                    ..Default::default()
                }),
                ZoneContent::Shard(Shard {
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    range_from: "f".to_string(),
                    range_to: String::new(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        };
        assert!(check_consistency(&Section::Zone(overlap)).is_err());
    }

    #[test]
    fn name_split_candidates() {
        assert_eq!(
            name_splits("example.ch"),
            vec![
                ("example".to_string(), "ch".to_string()),
                ("example.ch".to_string(), ".".to_string()),
            ]
        );
        assert_eq!(name_splits("ch"), vec![("ch".to_string(), ".".to_string())]);
        assert_eq!(
            name_splits("a.b.c"),
            vec![
                ("a".to_string(), "b.c".to_string()),
                ("a.b".to_string(), "c".to_string()),
                ("a.b.c".to_string(), ".".to_string()),
            ]
        );
    }

    #[test]
    fn child_zone_composition() {
        assert_eq!(child_zone("ch", "."), "ch");
        assert_eq!(child_zone("example", "ch"), "example.ch");
    }
}
