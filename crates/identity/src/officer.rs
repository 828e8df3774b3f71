//! Enrolled officer identities.

use killswitch_crypto::{key_id_for, PublicKeyBytes};
use serde::{Deserialize, Serialize};

/// An officer allowed to approve commands.
///
/// Revoked entries stay in the store permanently with their revocation
/// record; the id can never be enrolled again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficerIdentity {
    pub officer_id: String,
    /// Ed25519 public key share held by the officer's signing device
    #[serde(with = "hex::serde")]
    pub public_key: PublicKeyBytes,
    /// Role or rank tag, informational only
    pub role: String,
    /// Enrollment time (nanoseconds since epoch)
    pub enrolled_at_ns: u64,
    pub revocation: Option<Revocation>,
}

/// Permanent revocation marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub revoked_at_ns: u64,
    pub reason: String,
}

impl OfficerIdentity {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn is_active(&self) -> bool {
        !self.is_revoked()
    }

    /// Key id of the enrolled share, safe to log
    pub fn key_id(&self) -> String {
        key_id_for(&self.public_key)
    }
}
