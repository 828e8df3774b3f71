//! Key custody capability.
//!
//! Officer signing devices and the platform root of trust are external,
//! HSM-backed services. The control plane only sees them through
//! [`KeyCustody`]: a key id, a public key, and `sign(bytes)`. Private material
//! never crosses this boundary. [`SoftwareCustody`] is the in-process
//! implementation used for the issuer key and for tests.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use zeroize::Zeroize;

use crate::canonical::blake3_digest;
use crate::error::CryptoError;

/// Ed25519 public key bytes
pub type PublicKeyBytes = [u8; 32];

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// Opaque signing capability.
pub trait KeyCustody: Send + Sync {
    /// Stable identifier derived from the public key
    fn key_id(&self) -> &str;

    /// Ed25519 public key
    fn public_key(&self) -> PublicKeyBytes;

    /// Sign `message`, returning a 64-byte Ed25519 signature
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// In-process Ed25519 custody.
pub struct SoftwareCustody {
    signing_key: SigningKey,
    key_id: String,
}

impl std::fmt::Debug for SoftwareCustody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareCustody")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SoftwareCustody {
    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let custody = Self::from_seed_array(&seed);
        seed.zeroize();
        custody
    }

    /// Load a key from a 32-byte seed. The caller's copy is not touched;
    /// the internal copy is zeroized after use.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() != 32 {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "seed must be 32 bytes, got {}",
                seed.len()
            )));
        }
        let mut seed_array = [0u8; 32];
        seed_array.copy_from_slice(seed);
        let custody = Self::from_seed_array(&seed_array);
        seed_array.zeroize();
        Ok(custody)
    }

    fn from_seed_array(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let key_id = key_id_for(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            key_id,
        }
    }
}

impl KeyCustody for SoftwareCustody {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn public_key(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

/// Stable key identifier: first 16 bytes of BLAKE3(public key), hex encoded.
pub fn key_id_for(public_key: &PublicKeyBytes) -> String {
    hex::encode(&blake3_digest(public_key)[..16])
}

/// Reject byte strings that are not a valid Ed25519 point or that have
/// small order.
pub fn validate_public_key(public_key: &PublicKeyBytes) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    if key.is_weak() {
        return Err(CryptoError::InvalidPublicKey("small-order key".to_string()));
    }
    Ok(())
}

/// Verify an Ed25519 signature. Uses strict verification, which rejects
/// small-order keys and non-canonical signatures.
pub fn verify_signature(
    signer: &str,
    public_key: &PublicKeyBytes,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptoError::MalformedSignature(signature.len()))?;

    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    verifying_key
        .verify_strict(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| CryptoError::InvalidSignature {
            signer: signer.to_string(),
            reason: e.to_string(),
        })
}
