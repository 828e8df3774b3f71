//! Authority-side error types

use killswitch_core::AuditError;
use killswitch_crypto::CryptoError;
use killswitch_domain::{DomainError, ProposalId};
use killswitch_identity::IdentityError;
use thiserror::Error;

/// Errors from opening proposals and collecting approvals.
///
/// Submission errors are reported back to the submitting officer's client
/// and never affect other officers' pending approvals.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Duplicate proposal: {proposal_id}")]
    DuplicateProposal { proposal_id: ProposalId },

    #[error("Unknown proposal: {proposal_id}")]
    UnknownProposal { proposal_id: ProposalId },

    /// Proposal is satisfied, issued or aborted
    #[error("Proposal {proposal_id} is closed ({phase})")]
    ProposalClosed {
        proposal_id: ProposalId,
        phase: &'static str,
    },

    #[error("Proposal {proposal_id} expired")]
    ProposalExpired { proposal_id: ProposalId },

    #[error("Approval references proposal {actual}, submitted to {expected}")]
    ProposalMismatch {
        expected: ProposalId,
        actual: ProposalId,
    },

    #[error("Unknown officer: {officer_id}")]
    UnknownOfficer { officer_id: String },

    #[error("Officer revoked: {officer_id}")]
    RevokedOfficer { officer_id: String },

    #[error("Duplicate approval from {officer_id}")]
    DuplicateApproval { officer_id: String },

    #[error("Invalid signature from {officer_id}: {reason}")]
    InvalidSignature { officer_id: String, reason: String },

    #[error("Invalid threshold {threshold} with {active} active officers")]
    InvalidThreshold { threshold: usize, active: usize },

    #[error("Threshold {threshold} is below the provisioned group threshold {required}")]
    ThresholdBelowGroup { threshold: usize, required: usize },

    #[error("Invalid collection window: {0}")]
    InvalidWindow(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(#[from] DomainError),

    #[error("Vetoed by compliance gate: {reason}")]
    ComplianceVeto { reason: String },

    #[error("Key share store error: {0}")]
    KeyStore(IdentityError),

    /// Fail-closed: nothing is accepted without its audit record
    #[error("Audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error("Proposal state lock poisoned")]
    LockPoisoned,
}

impl From<IdentityError> for CollectorError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::UnknownOfficer { officer_id } => {
                CollectorError::UnknownOfficer { officer_id }
            }
            IdentityError::RevokedOfficer { officer_id } => {
                CollectorError::RevokedOfficer { officer_id }
            }
            IdentityError::InvalidSignature { officer_id, reason } => {
                CollectorError::InvalidSignature { officer_id, reason }
            }
            other => CollectorError::KeyStore(other),
        }
    }
}

/// Errors from issuing a signed command.
///
/// `QuorumNotMet` and `AlreadyIssued` indicate an ordering defect in the
/// caller unless they come out of an expected race.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Unknown proposal: {proposal_id}")]
    UnknownProposal { proposal_id: ProposalId },

    #[error("Quorum not met for {proposal_id}: {count} of {threshold}")]
    QuorumNotMet {
        proposal_id: ProposalId,
        count: usize,
        threshold: usize,
    },

    #[error("Proposal {proposal_id} already issued")]
    AlreadyIssued { proposal_id: ProposalId },

    #[error("Proposal {proposal_id} is closed ({phase})")]
    ProposalClosed {
        proposal_id: ProposalId,
        phase: &'static str,
    },

    #[error("Proposal {proposal_id} expired before issuance")]
    ProposalExpired { proposal_id: ProposalId },

    #[error("Command TTL {requested_secs}s exceeds maximum {max_secs}s")]
    TtlTooLong { requested_secs: u64, max_secs: u64 },

    #[error("Command TTL must be at least one second")]
    ZeroTtl,

    #[error("Issuer configuration error: {0}")]
    Config(String),

    #[error("Signature assembly failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Key share store error: {0}")]
    KeyStore(#[from] IdentityError),

    #[error("Audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error("Issuer state lock poisoned")]
    LockPoisoned,
}
