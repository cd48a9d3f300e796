//! # rainsd - RAINS Server Core
//!
//! rainsd is a server for RAINS, a DNS-like naming and authentication
//! protocol: it accepts TLS-framed messages from peers, routes them
//! through a prioritized worker pipeline, verifies and caches signed
//! assertions about name bindings, answers queries from its caches and
//! forwards the rest - under concurrent I/O with bounded resources.
//!
//! ## Architecture
//!
//! Bytes arrive on a TLS stream, are framed into one CBOR message, and
//! each section is classified onto one of three bounded queues (`Prio`,
//! `Normal`, `Notify`). A worker leases a slot and runs the trust engine:
//! results mutate caches, emit a reply, or park in a pending cache until
//! the event that unblocks them arrives. Background reapers expire cache
//! entries on TTL and checkpoint state to disk.
//!
//! - All shared state lives in bounded, internally synchronized caches;
//!   no cache lock is held across I/O.
//! - Trust flows through the zone-key cache: a section is admitted only
//!   when a cached key verifies one of its signatures. Keys that have not
//!   arrived yet park the work instead of failing it.
//! - The server is a value, not a set of globals: configuration, caches,
//!   queues, TLS identity and lifecycle channels are owned by [`Server`]
//!   and passed explicitly.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `message` | Data model: tokens, sections, objects, queries, notifications, capabilities, section ordering |
//! | `signature` | Sign/verify under Ed25519 and ECDSA P-256/P-384, tagged signature payloads |
//! | `canonical` | Deterministic signable byte encoding of sections and messages |
//! | `wire` | CBOR codec and length-delimited stream framing with size limits |
//! | `cache` | Bounded LRU caches: zone keys, assertions, range proofs, pending work, capabilities, connections |
//! | `engine` | Trust engine: consistency, verification, validity, ingest, pending release, query answering |
//! | `queue` | Three prioritized bounded queues with worker-slot semaphores |
//! | `switchboard` | TLS listen/dial, framing delivery, send with retry and backoff |
//! | `server` | Configuration binding and server lifecycle |

pub mod cache;
pub mod canonical;
pub mod engine;
pub mod message;
pub mod queue;
pub mod server;
pub mod signature;
pub mod switchboard;
pub mod wire;

pub use engine::{EngineConfig, MaxValidity, Outbound, TrustEngine};
pub use message::{
    capability_hash, Assertion, Capability, Message, Notification, NotificationKind, Object,
    ObjectKind, Peer, Query, QueryOption, Section, Shard, Token, Zone,
};
pub use server::{Config, Server, ServerError};
pub use signature::{Algorithm, KeySpace, PrivateKey, PublicKey, Signature, SignatureData};
pub use switchboard::{IsBlocked, NeverBlocked, SendError, Switchboard};
