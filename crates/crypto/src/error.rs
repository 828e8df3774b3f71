//! Cryptographic error types

use thiserror::Error;

/// Errors raised by custody, signature, and group-key operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Malformed signature: expected 64 bytes, got {0}")]
    MalformedSignature(usize),

    #[error("Signature verification failed for {signer}: {reason}")]
    InvalidSignature { signer: String, reason: String },

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Key custody failure: {0}")]
    Custody(String),

    #[error("Key epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },

    #[error("Combined signature was produced for a different group key")]
    GroupMismatch,

    #[error("Signer {0} is not a member of the group")]
    UnknownSigner(String),

    #[error("Signer {0} contributed more than one share")]
    DuplicateSigner(String),

    #[error("Insufficient signature shares: got {got}, required {required}")]
    InsufficientShares { got: usize, required: usize },

    #[error("Invalid threshold {threshold} for {members} members")]
    InvalidThreshold { threshold: usize, members: usize },
}
