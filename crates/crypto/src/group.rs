//! Group verification key and the combined command signature.
//!
//! A command is authorized by a t-of-M multi-signature: each approving officer
//! signs the proposal's approval message with their own key, and the issuer
//! binds the selected shares to the issuance envelope (issued_at, nonce, ttl)
//! with its own signature. Platforms are provisioned with the
//! [`GroupVerificationKey`] and check both layers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::canonical::{domains, CanonicalEncoder, Digest};
use crate::custody::{verify_signature, KeyCustody, PublicKeyBytes};
use crate::error::CryptoError;

/// Signer id used in errors raised against the issuer signature.
pub const ISSUER_SIGNER: &str = "issuer";

/// Group verification key distributed to every receiving platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVerificationKey {
    /// Rotation epoch; commands signed under another epoch never verify
    pub key_epoch: u64,
    /// Minimum number of distinct member signatures
    pub threshold: usize,
    /// Officer id -> Ed25519 public key
    #[serde(with = "hex_key_map")]
    pub members: BTreeMap<String, PublicKeyBytes>,
    /// Issuer public key binding the envelope
    #[serde(with = "hex::serde")]
    pub issuer_key: PublicKeyBytes,
}

impl GroupVerificationKey {
    pub fn new(
        key_epoch: u64,
        threshold: usize,
        members: BTreeMap<String, PublicKeyBytes>,
        issuer_key: PublicKeyBytes,
    ) -> Result<Self, CryptoError> {
        if threshold == 0 || threshold > members.len() {
            return Err(CryptoError::InvalidThreshold {
                threshold,
                members: members.len(),
            });
        }
        Ok(Self {
            key_epoch,
            threshold,
            members,
            issuer_key,
        })
    }

    /// BLAKE3 fingerprint over epoch, threshold, members and issuer key
    pub fn fingerprint(&self) -> Digest {
        let mut enc = CanonicalEncoder::new(domains::GROUP_KEY);
        enc.put_u64(self.key_epoch)
            .put_u64(self.threshold as u64)
            .put_u64(self.members.len() as u64);
        for (id, key) in &self.members {
            enc.put_str(id).put_bytes(key);
        }
        enc.put_bytes(&self.issuer_key);
        enc.digest()
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    /// Verify a combined signature.
    ///
    /// `approval_message` is what each officer signed; `envelope_message`
    /// is what the issuer signed. Checks run in order: epoch, group
    /// fingerprint, every share (known, distinct, valid), share count,
    /// issuer signature.
    pub fn verify(
        &self,
        approval_message: &[u8],
        envelope_message: &[u8],
        signature: &CombinedSignature,
    ) -> Result<(), CryptoError> {
        if signature.key_epoch != self.key_epoch {
            return Err(CryptoError::EpochMismatch {
                expected: self.key_epoch,
                actual: signature.key_epoch,
            });
        }
        if signature.group_fingerprint != self.fingerprint() {
            return Err(CryptoError::GroupMismatch);
        }

        let mut seen = BTreeSet::new();
        for share in &signature.shares {
            let key = self
                .members
                .get(&share.signer_id)
                .ok_or_else(|| CryptoError::UnknownSigner(share.signer_id.clone()))?;
            if !seen.insert(share.signer_id.as_str()) {
                return Err(CryptoError::DuplicateSigner(share.signer_id.clone()));
            }
            verify_signature(&share.signer_id, key, approval_message, &share.signature)?;
        }

        if seen.len() < self.threshold {
            return Err(CryptoError::InsufficientShares {
                got: seen.len(),
                required: self.threshold,
            });
        }

        verify_signature(
            ISSUER_SIGNER,
            &self.issuer_key,
            envelope_message,
            &signature.issuer_signature,
        )
    }
}

/// One officer's signature over the approval message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub signer_id: String,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

/// t-of-M officer shares plus the issuer's envelope signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedSignature {
    pub key_epoch: u64,
    #[serde(with = "hex::serde")]
    pub group_fingerprint: Digest,
    /// Sorted by signer id
    pub shares: Vec<SignatureShare>,
    #[serde(with = "hex::serde")]
    pub issuer_signature: Vec<u8>,
}

impl CombinedSignature {
    /// Combine officer shares under `group` and sign the envelope with
    /// `issuer`.
    ///
    /// `envelope` receives the sorted signer ids and must return the exact
    /// bytes platforms will rebuild from the command.
    pub fn combine<F>(
        group: &GroupVerificationKey,
        mut shares: Vec<SignatureShare>,
        issuer: &dyn KeyCustody,
        envelope: F,
    ) -> Result<Self, CryptoError>
    where
        F: FnOnce(&[String]) -> Vec<u8>,
    {
        if issuer.public_key() != group.issuer_key {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "issuer key {} does not match the group issuer key",
                issuer.key_id()
            )));
        }

        shares.sort_by(|a, b| a.signer_id.cmp(&b.signer_id));
        for pair in shares.windows(2) {
            if pair[0].signer_id == pair[1].signer_id {
                return Err(CryptoError::DuplicateSigner(pair[0].signer_id.clone()));
            }
        }
        if let Some(unknown) = shares
            .iter()
            .find(|s| !group.members.contains_key(&s.signer_id))
        {
            return Err(CryptoError::UnknownSigner(unknown.signer_id.clone()));
        }
        if shares.len() < group.threshold {
            return Err(CryptoError::InsufficientShares {
                got: shares.len(),
                required: group.threshold,
            });
        }

        let signer_ids: Vec<String> = shares.iter().map(|s| s.signer_id.clone()).collect();
        let issuer_signature = issuer.sign(&envelope(&signer_ids))?;

        Ok(Self {
            key_epoch: group.key_epoch,
            group_fingerprint: group.fingerprint(),
            shares,
            issuer_signature,
        })
    }

    pub fn signer_ids(&self) -> Vec<String> {
        self.shares.iter().map(|s| s.signer_id.clone()).collect()
    }
}

mod hex_key_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::custody::PublicKeyBytes;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, PublicKeyBytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(id, key)| (id.clone(), hex::encode(key)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, PublicKeyBytes>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(id, key_hex)| {
                let mut key = [0u8; 32];
                hex::decode_to_slice(&key_hex, &mut key).map_err(D::Error::custom)?;
                Ok((id, key))
            })
            .collect()
    }
}
