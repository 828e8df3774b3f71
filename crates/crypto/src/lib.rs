//! Cryptographic primitives for the kill-switch control plane.
//!
//! Provides the canonical signing encoding, the key-custody capability that
//! stands in for officer HSMs and the platform root of trust, the group
//! verification key with its t-of-M combined signature, and command nonces.

pub mod canonical;
pub mod custody;
pub mod error;
pub mod group;
pub mod nonce;

pub use canonical::{blake3_digest, domains, CanonicalEncoder, Digest};
pub use custody::{
    key_id_for, validate_public_key, verify_signature, KeyCustody, PublicKeyBytes, SoftwareCustody,
};
pub use error::CryptoError;
pub use group::{CombinedSignature, GroupVerificationKey, SignatureShare, ISSUER_SIGNER};
pub use nonce::{Nonce, NonceGenerator};
