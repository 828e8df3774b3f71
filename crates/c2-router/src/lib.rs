//! Authority side of the kill-switch control plane.
//!
//! Officers' partial approvals flow into the [`ApprovalCollector`]; once a
//! proposal reaches its threshold the [`CommandIssuer`] assembles the
//! combined signature and emits a single, short-lived [`SignedCommand`]
//! for delivery to receiving platforms. A [`ComplianceGate`] supplied by the
//! rules-of-engagement engine can veto proposals before collection starts.
//!
//! [`SignedCommand`]: killswitch_domain::SignedCommand

pub mod compliance;
pub mod error;
pub mod issuer;
pub mod quorum;

pub use compliance::{ClearAll, ComplianceGate, ComplianceVerdict};
pub use error::{CollectorError, IssueError};
pub use issuer::{CommandIssuer, IssuerPolicy, ISSUER_SOURCE};
pub use quorum::{ApprovalCollector, ProposalPhase, QuorumState, QuorumStatus, COLLECTOR_SOURCE};
