//! Command proposals and their canonical encoding

use std::fmt;
use std::str::FromStr;

use killswitch_crypto::{domains, CanonicalEncoder, Digest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{ActionType, TargetSet};
use crate::error::{DomainError, Result};

/// Unique proposal identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProposalId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidProposalId(e.to_string()))
    }
}

/// A proposed safety-critical command awaiting officer approval.
///
/// Fields are private: a proposal is immutable once created, and its
/// canonical digest is what officers sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandProposal {
    proposal_id: ProposalId,
    action: ActionType,
    targets: TargetSet,
    proposer_id: String,
    created_at_ns: u64,
    /// Detection/classification metadata attached by upstream systems.
    /// Opaque here: only its digest is signed.
    #[serde(default)]
    context: Option<serde_json::Value>,
}

impl CommandProposal {
    pub fn new(
        action: ActionType,
        targets: TargetSet,
        proposer_id: impl Into<String>,
        created_at_ns: u64,
        context: Option<serde_json::Value>,
    ) -> Result<Self> {
        Self::with_id(
            ProposalId::new(),
            action,
            targets,
            proposer_id,
            created_at_ns,
            context,
        )
    }

    pub fn with_id(
        proposal_id: ProposalId,
        action: ActionType,
        targets: TargetSet,
        proposer_id: impl Into<String>,
        created_at_ns: u64,
        context: Option<serde_json::Value>,
    ) -> Result<Self> {
        let proposal = Self {
            proposal_id,
            action,
            targets,
            proposer_id: proposer_id.into(),
            created_at_ns,
            context,
        };
        proposal.validate()?;
        Ok(proposal)
    }

    /// Structural checks; also run on proposals received over the wire
    pub fn validate(&self) -> Result<()> {
        if self.proposer_id.is_empty() {
            return Err(DomainError::InvalidProposal(
                "proposer id is empty".to_string(),
            ));
        }
        if self.targets.addresses_nobody() {
            return Err(DomainError::InvalidProposal(
                "target set addresses no platform or fleet".to_string(),
            ));
        }
        match self.action {
            ActionType::Engage if self.targets.designators.is_empty() => Err(
                DomainError::InvalidProposal("ENGAGE requires a target designator".to_string()),
            ),
            ActionType::ShutdownFleet if self.targets.fleets.is_empty() => Err(
                DomainError::InvalidProposal("SHUTDOWN_FLEET requires a fleet".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn proposal_id(&self) -> ProposalId {
        self.proposal_id
    }

    pub fn action(&self) -> ActionType {
        self.action
    }

    pub fn targets(&self) -> &TargetSet {
        &self.targets
    }

    pub fn proposer_id(&self) -> &str {
        &self.proposer_id
    }

    pub fn created_at_ns(&self) -> u64 {
        self.created_at_ns
    }

    pub fn context(&self) -> Option<&serde_json::Value> {
        self.context.as_ref()
    }

    /// Digest of the opaque context, or all zeros when absent
    pub fn context_digest(&self) -> Digest {
        context_digest(self.context.as_ref())
    }

    /// Canonical digest that officers sign
    pub fn digest(&self) -> Digest {
        proposal_digest(
            &self.proposal_id,
            self.action,
            &self.targets,
            &self.proposer_id,
            self.created_at_ns,
            &self.context_digest(),
        )
    }
}

fn context_digest(context: Option<&serde_json::Value>) -> Digest {
    match context {
        // serde_json maps are key-sorted, so this encoding is deterministic
        Some(value) => {
            let mut enc = CanonicalEncoder::new(domains::CONTEXT);
            enc.put_str(&value.to_string());
            enc.digest()
        }
        None => [0u8; 32],
    }
}

/// Canonical proposal digest, shared by proposals and the commands issued
/// from them.
pub(crate) fn proposal_digest(
    proposal_id: &ProposalId,
    action: ActionType,
    targets: &TargetSet,
    proposer_id: &str,
    created_at_ns: u64,
    context_digest: &Digest,
) -> Digest {
    let mut enc = CanonicalEncoder::new(domains::PROPOSAL);
    enc.put_bytes(proposal_id.0.as_bytes())
        .put_str(action.as_str())
        .put_str_list(targets.platforms.iter().map(String::as_str))
        .put_str_list(targets.fleets.iter().map(String::as_str))
        .put_str_list(targets.designators.iter().map(String::as_str))
        .put_str(proposer_id)
        .put_u64(created_at_ns)
        .put_digest(context_digest);
    enc.digest()
}
