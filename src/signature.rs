//! # Signature Engine
//!
//! Cryptographic signing and verification for RAINS sections and messages.
//!
//! - **Ed25519**: via `ed25519-dalek`, strict verification
//! - **ECDSA-P256/SHA-256** and **ECDSA-P384/SHA-384**: via the RustCrypto
//!   `p256`/`p384` crates, signatures carried as an (r, s) scalar pair
//! - **Ed448**: representable on the wire, rejected by the primitives
//!
//! ## Signing Model
//!
//! A [`Signature`] carries its own key space, algorithm, key phase and
//! validity window. Before the primitive runs, the signature's metadata
//! string (`"<keySpace> <algo> <validSince> <validUntil>"`) is appended
//! verbatim to the canonical byte encoding of the payload, so the window a
//! signature claims is itself covered by the signature.
//!
//! ## Opaque Signature Payload
//!
//! Signature bytes are a tagged union [`SignatureData`]: raw bytes for the
//! Edwards curves, an explicit big-endian (r, s) pair for ECDSA. Downstream
//! code matches on the tag and never inspects algorithm-specific encodings.
//!
//! ## Failure Semantics
//!
//! `sign` returns a typed error. `verify` returns a bool and never panics:
//! missing data, mismatched key material and unsupported algorithms all
//! verify to false.

use p256::ecdsa::signature::hazmat::PrehashSigner as _;
use p256::ecdsa::signature::hazmat::PrehashVerifier as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};

// ============================================================================
// Algorithms and Key Spaces
// ============================================================================

/// Signature algorithm identifiers with their wire numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Ed25519 = 1,
    /// Reserved. Accepted on the wire, unsupported by the primitives.
    Ed448 = 2,
    EcdsaP256 = 3,
    EcdsaP384 = 4,
}

impl Algorithm {
    /// Wire number used in signature metadata and canonical encodings.
    pub fn wire(self) -> u8 {
        self as u8
    }
}

/// Key space a key or signature belongs to. Only the RAINS key space is
/// currently assigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeySpace {
    #[default]
    Rains = 0,
}

impl KeySpace {
    pub fn wire(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for signing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignError {
    /// The algorithm is recognized but has no primitive (Ed448).
    UnsupportedAlgorithm,
    /// The private key material does not match the signature's algorithm.
    KeyTypeMismatch,
    /// The underlying cryptographic primitive failed.
    PrimitiveFailure,
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::UnsupportedAlgorithm => write!(f, "signature algorithm not supported"),
            SignError::KeyTypeMismatch => write!(f, "private key does not match signature algorithm"),
            SignError::PrimitiveFailure => write!(f, "signature primitive failed"),
        }
    }
}

impl std::error::Error for SignError {}

// ============================================================================
// Key Material
// ============================================================================

/// Public key material, tagged by algorithm.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyData {
    Ed25519([u8; 32]),
    /// Reserved; carried opaquely.
    Ed448(Vec<u8>),
    /// SEC1-encoded point.
    EcdsaP256(Vec<u8>),
    /// SEC1-encoded point.
    EcdsaP384(Vec<u8>),
}

impl KeyData {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            KeyData::Ed25519(_) => Algorithm::Ed25519,
            KeyData::Ed448(_) => Algorithm::Ed448,
            KeyData::EcdsaP256(_) => Algorithm::EcdsaP256,
            KeyData::EcdsaP384(_) => Algorithm::EcdsaP384,
        }
    }

    /// Raw key bytes as carried in canonical encodings.
    pub fn bytes(&self) -> &[u8] {
        match self {
            KeyData::Ed25519(b) => b,
            KeyData::Ed448(b) => b,
            KeyData::EcdsaP256(b) => b,
            KeyData::EcdsaP384(b) => b,
        }
    }
}

/// A public key together with the zone-key attributes the trust engine
/// matches on: key space, phase and validity window.
///
/// Invariant: `valid_since <= valid_until`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub key_space: KeySpace,
    pub key_phase: u32,
    pub valid_since: i64,
    pub valid_until: i64,
    pub key: KeyData,
}

impl PublicKey {
    pub fn algorithm(&self) -> Algorithm {
        self.key.algorithm()
    }

    /// True if the key's validity window contains `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.valid_since <= now && now <= self.valid_until
    }

    /// True if the key's window overlaps `[since, until]`.
    pub fn overlaps(&self, since: i64, until: i64) -> bool {
        self.valid_since <= until && since <= self.valid_until
    }
}

/// Private key material, tagged by algorithm. Scalar bytes only; the
/// corresponding public key is derivable.
#[derive(Clone)]
pub enum PrivateKey {
    Ed25519(Box<ed25519_dalek::SigningKey>),
    EcdsaP256(Box<p256::ecdsa::SigningKey>),
    EcdsaP384(Box<p384::ecdsa::SigningKey>),
}

impl PrivateKey {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            PrivateKey::Ed25519(_) => Algorithm::Ed25519,
            PrivateKey::EcdsaP256(_) => Algorithm::EcdsaP256,
            PrivateKey::EcdsaP384(_) => Algorithm::EcdsaP384,
        }
    }

    /// Generate a fresh key for the given algorithm. Used by delegation
    /// tooling and tests.
    pub fn generate(algorithm: Algorithm) -> Result<Self, SignError> {
        let mut rng = rand::rngs::OsRng;
        match algorithm {
            Algorithm::Ed25519 => Ok(PrivateKey::Ed25519(Box::new(
                ed25519_dalek::SigningKey::generate(&mut rng),
            ))),
            Algorithm::EcdsaP256 => Ok(PrivateKey::EcdsaP256(Box::new(
                p256::ecdsa::SigningKey::random(&mut rng),
            ))),
            Algorithm::EcdsaP384 => Ok(PrivateKey::EcdsaP384(Box::new(
                p384::ecdsa::SigningKey::random(&mut rng),
            ))),
            Algorithm::Ed448 => Err(SignError::UnsupportedAlgorithm),
        }
    }

    /// The public key material corresponding to this private key.
    pub fn key_data(&self) -> KeyData {
        match self {
            PrivateKey::Ed25519(sk) => KeyData::Ed25519(sk.verifying_key().to_bytes()),
            PrivateKey::EcdsaP256(sk) => KeyData::EcdsaP256(
                sk.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            ),
            PrivateKey::EcdsaP384(sk) => KeyData::EcdsaP384(
                sk.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            ),
        }
    }

    /// Build the matching zone key with the given phase and validity window.
    pub fn public_key(&self, key_phase: u32, valid_since: i64, valid_until: i64) -> PublicKey {
        PublicKey {
            key_space: KeySpace::Rains,
            key_phase,
            valid_since,
            valid_until,
            key: self.key_data(),
        }
    }
}

// ============================================================================
// Signatures
// ============================================================================

/// Opaque signature payload: raw bytes for Edwards curves, an explicit
/// (r, s) pair in big-endian for ECDSA.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignatureData {
    Ed(Vec<u8>),
    Ecdsa { r: Vec<u8>, s: Vec<u8> },
}

/// Signature on a message or section.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub key_space: KeySpace,
    pub algorithm: Algorithm,
    pub key_phase: u32,
    pub valid_since: i64,
    pub valid_until: i64,
    pub data: Option<SignatureData>,
}

impl Signature {
    /// A signature shell with no data yet; `sign` fills it in.
    pub fn new(algorithm: Algorithm, key_phase: u32, valid_since: i64, valid_until: i64) -> Self {
        Signature {
            key_space: KeySpace::Rains,
            algorithm,
            key_phase,
            valid_since,
            valid_until,
            data: None,
        }
    }

    /// Metadata string appended to the canonical payload before the
    /// primitive runs. Format: `"<keySpace> <algo> <validSince> <validUntil>"`.
    pub fn meta_data(&self) -> String {
        format!(
            "{} {} {} {}",
            self.key_space.wire(),
            self.algorithm.wire(),
            self.valid_since,
            self.valid_until
        )
    }

    /// Sign `canonical` with `private_key`, storing the result in `self.data`.
    ///
    /// The signature metadata is appended to `canonical` before signing, so
    /// callers pass the bare canonical section bytes.
    pub fn sign(&mut self, private_key: &PrivateKey, canonical: &[u8]) -> Result<(), SignError> {
        let payload = with_meta_data(canonical, self);
        match (self.algorithm, private_key) {
            (Algorithm::Ed25519, PrivateKey::Ed25519(sk)) => {
                use ed25519_dalek::Signer as _;
                let sig = sk.sign(&payload);
                self.data = Some(SignatureData::Ed(sig.to_bytes().to_vec()));
                Ok(())
            }
            (Algorithm::EcdsaP256, PrivateKey::EcdsaP256(sk)) => {
                let digest = Sha256::digest(&payload);
                let sig: p256::ecdsa::Signature = sk
                    .sign_prehash(&digest)
                    .map_err(|_| SignError::PrimitiveFailure)?;
                let (r, s) = sig.split_bytes();
                self.data = Some(SignatureData::Ecdsa {
                    r: r.to_vec(),
                    s: s.to_vec(),
                });
                Ok(())
            }
            (Algorithm::EcdsaP384, PrivateKey::EcdsaP384(sk)) => {
                let digest = Sha384::digest(&payload);
                let sig: p384::ecdsa::Signature = sk
                    .sign_prehash(&digest)
                    .map_err(|_| SignError::PrimitiveFailure)?;
                let (r, s) = sig.split_bytes();
                self.data = Some(SignatureData::Ecdsa {
                    r: r.to_vec(),
                    s: s.to_vec(),
                });
                Ok(())
            }
            (Algorithm::Ed448, _) => Err(SignError::UnsupportedAlgorithm),
            _ => Err(SignError::KeyTypeMismatch),
        }
    }

    /// Verify this signature over `canonical` with `public_key`.
    ///
    /// Returns false for absent data, algorithm or key-type mismatches and
    /// unsupported algorithms. Never panics.
    pub fn verify(&self, public_key: &PublicKey, canonical: &[u8]) -> bool {
        let Some(data) = &self.data else {
            return false;
        };
        if public_key.algorithm() != self.algorithm {
            return false;
        }
        let payload = with_meta_data(canonical, self);
        match (&public_key.key, data) {
            (KeyData::Ed25519(pk_bytes), SignatureData::Ed(sig_bytes)) => {
                let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(pk_bytes) else {
                    return false;
                };
                let Ok(sig_arr) = <&[u8; 64]>::try_from(sig_bytes.as_slice()) else {
                    return false;
                };
                let sig = ed25519_dalek::Signature::from_bytes(sig_arr);
                vk.verify_strict(&payload, &sig).is_ok()
            }
            (KeyData::EcdsaP256(pk_bytes), SignatureData::Ecdsa { r, s }) => {
                let Ok(vk) = p256::ecdsa::VerifyingKey::from_sec1_bytes(pk_bytes) else {
                    return false;
                };
                let Some(sig) = ecdsa_p256_from_scalars(r, s) else {
                    return false;
                };
                let digest = Sha256::digest(&payload);
                vk.verify_prehash(&digest, &sig).is_ok()
            }
            (KeyData::EcdsaP384(pk_bytes), SignatureData::Ecdsa { r, s }) => {
                let Ok(vk) = p384::ecdsa::VerifyingKey::from_sec1_bytes(pk_bytes) else {
                    return false;
                };
                let Some(sig) = ecdsa_p384_from_scalars(r, s) else {
                    return false;
                };
                let digest = Sha384::digest(&payload);
                vk.verify_prehash(&digest, &sig).is_ok()
            }
            _ => false,
        }
    }
}

/// Canonical payload with signature metadata appended.
fn with_meta_data(canonical: &[u8], sig: &Signature) -> Vec<u8> {
    let meta = sig.meta_data();
    let mut payload = Vec::with_capacity(canonical.len() + meta.len());
    payload.extend_from_slice(canonical);
    payload.extend_from_slice(meta.as_bytes());
    payload
}

/// Rebuild a P-256 signature from big-endian scalar bytes, left-padding
/// short encodings to the 32-byte field width.
fn ecdsa_p256_from_scalars(r: &[u8], s: &[u8]) -> Option<p256::ecdsa::Signature> {
    let mut bytes = [0u8; 64];
    pad_scalar(&mut bytes[..32], r)?;
    pad_scalar(&mut bytes[32..], s)?;
    p256::ecdsa::Signature::from_slice(&bytes).ok()
}

/// Rebuild a P-384 signature from big-endian scalar bytes, left-padding
/// short encodings to the 48-byte field width.
fn ecdsa_p384_from_scalars(r: &[u8], s: &[u8]) -> Option<p384::ecdsa::Signature> {
    let mut bytes = [0u8; 96];
    pad_scalar(&mut bytes[..48], r)?;
    pad_scalar(&mut bytes[48..], s)?;
    p384::ecdsa::Signature::from_slice(&bytes).ok()
}

fn pad_scalar(dst: &mut [u8], src: &[u8]) -> Option<()> {
    if src.len() > dst.len() {
        return None;
    }
    let offset = dst.len() - src.len();
    dst[offset..].copy_from_slice(src);
    Some(())
}
