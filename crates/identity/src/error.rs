//! Error types for officer identity operations.

use killswitch_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in key-share store operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Officer id was never enrolled
    #[error("Unknown officer: {officer_id}")]
    UnknownOfficer { officer_id: String },

    /// Officer is permanently revoked
    #[error("Officer revoked: {officer_id}")]
    RevokedOfficer { officer_id: String },

    /// Officer id already enrolled (revoked ids are never reused)
    #[error("Officer already enrolled: {officer_id}")]
    AlreadyEnrolled { officer_id: String },

    #[error("Officer already revoked: {officer_id}")]
    AlreadyRevoked { officer_id: String },

    /// Signature did not verify against the enrolled key share
    #[error("Invalid signature from {officer_id}: {reason}")]
    InvalidSignature { officer_id: String, reason: String },

    /// Group key could not be built from the enrolled officers
    #[error("Group key error: {0}")]
    GroupKey(#[from] CryptoError),

    #[error("Invalid key share for {officer_id}: {reason}")]
    InvalidKeyShare { officer_id: String, reason: String },

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key share store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, IdentityError>;
