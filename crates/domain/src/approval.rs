//! Partial approvals submitted by officer signing devices

use killswitch_crypto::{domains, CanonicalEncoder, Digest, KeyCustody};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::proposal::{CommandProposal, ProposalId};

/// One officer's signature over a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialApproval {
    pub proposal_id: ProposalId,
    pub officer_id: String,
    /// Ed25519 signature over [`approval_message`]
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    pub submitted_at_ns: u64,
}

impl PartialApproval {
    /// Sign `proposal` inside `custody`. Officer devices run this; the
    /// control plane only ever verifies the result.
    pub fn sign(
        proposal: &CommandProposal,
        officer_id: impl Into<String>,
        custody: &dyn KeyCustody,
        submitted_at_ns: u64,
    ) -> Result<Self> {
        let signature = custody
            .sign(&approval_message(&proposal.digest()))
            .map_err(|e| DomainError::Signing(e.to_string()))?;
        Ok(Self {
            proposal_id: proposal.proposal_id(),
            officer_id: officer_id.into(),
            signature,
            submitted_at_ns,
        })
    }
}

/// Bytes an officer signs to approve the proposal with `proposal_digest`
pub fn approval_message(proposal_digest: &Digest) -> Vec<u8> {
    let mut enc = CanonicalEncoder::new(domains::APPROVAL);
    enc.put_digest(proposal_digest);
    enc.into_bytes()
}
