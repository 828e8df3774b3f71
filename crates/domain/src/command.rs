//! Signed commands delivered to receiving platforms.

use killswitch_core::time::secs_to_ns;
use killswitch_crypto::{
    domains, CanonicalEncoder, CombinedSignature, CryptoError, Digest, GroupVerificationKey, Nonce,
};
use serde::{Deserialize, Serialize};

use crate::action::{ActionType, TargetSet};
use crate::approval::approval_message;
use crate::proposal::{proposal_digest, ProposalId};

/// A quorum-authorized, time-bounded, replay-protected command.
///
/// Carries every proposal field needed to rebuild the digest the officers
/// signed, plus the issuance envelope bound by the issuer signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommand {
    pub proposal_id: ProposalId,
    pub cmd: ActionType,
    pub targets: TargetSet,
    pub proposer_id: String,
    pub proposed_at_ns: u64,
    #[serde(with = "hex::serde")]
    pub context_digest: Digest,
    pub issued_at_ns: u64,
    pub nonce: Nonce,
    pub ttl_secs: u64,
    pub key_epoch: u64,
    pub combined_signature: CombinedSignature,
}

impl SignedCommand {
    pub fn proposal_digest(&self) -> Digest {
        proposal_digest(
            &self.proposal_id,
            self.cmd,
            &self.targets,
            &self.proposer_id,
            self.proposed_at_ns,
            &self.context_digest,
        )
    }

    /// What each approving officer signed
    pub fn approval_message(&self) -> Vec<u8> {
        approval_message(&self.proposal_digest())
    }

    /// What the issuer signed
    pub fn envelope_message(&self) -> Vec<u8> {
        envelope_message(
            &self.proposal_digest(),
            self.issued_at_ns,
            &self.nonce,
            self.ttl_secs,
            self.key_epoch,
            &self.combined_signature.group_fingerprint,
            &self.combined_signature.signer_ids(),
        )
    }

    /// End of the validity window (nanoseconds since epoch)
    pub fn expires_at_ns(&self) -> u64 {
        self.issued_at_ns.saturating_add(secs_to_ns(self.ttl_secs))
    }

    /// Verify both signature layers under `group`
    pub fn verify_signature(&self, group: &GroupVerificationKey) -> Result<(), CryptoError> {
        if self.key_epoch != self.combined_signature.key_epoch {
            return Err(CryptoError::EpochMismatch {
                expected: self.key_epoch,
                actual: self.combined_signature.key_epoch,
            });
        }
        group.verify(
            &self.approval_message(),
            &self.envelope_message(),
            &self.combined_signature,
        )
    }
}

/// Issuance envelope: binds the proposal, the signer set, and the
/// issued_at/nonce/ttl that make the command single-use and short-lived.
pub fn envelope_message(
    proposal_digest: &Digest,
    issued_at_ns: u64,
    nonce: &Nonce,
    ttl_secs: u64,
    key_epoch: u64,
    group_fingerprint: &Digest,
    signer_ids: &[String],
) -> Vec<u8> {
    let mut enc = CanonicalEncoder::new(domains::ENVELOPE);
    enc.put_digest(proposal_digest)
        .put_u64(issued_at_ns)
        .put_bytes(nonce.as_bytes())
        .put_u64(ttl_secs)
        .put_u64(key_epoch)
        .put_digest(group_fingerprint)
        .put_str_list(signer_ids.iter().map(String::as_str));
    enc.into_bytes()
}
