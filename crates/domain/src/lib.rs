//! Domain model for the kill-switch control plane.
//!
//! Pure types with no I/O:
//! - Action types and target sets
//! - Immutable command proposals and their canonical digest
//! - Partial approvals from officer signing devices
//! - Signed commands and the issuance envelope

pub mod action;
pub mod approval;
pub mod command;
pub mod error;
pub mod proposal;

pub use action::{ActionType, TargetSet};
pub use approval::{approval_message, PartialApproval};
pub use command::{envelope_message, SignedCommand};
pub use error::{DomainError, Result};
pub use proposal::{CommandProposal, ProposalId};
