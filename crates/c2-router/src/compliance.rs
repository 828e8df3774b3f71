//! Rules-of-engagement compliance gate.
//!
//! An external rule engine decides whether a proposal may be opened at all.
//! Its verdict is consumed here as a clear/veto input; the rules themselves
//! live outside this crate.

use killswitch_domain::CommandProposal;

/// Verdict returned by a [`ComplianceGate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceVerdict {
    Clear,
    Veto { reason: String },
}

/// Consulted by `ApprovalCollector::open` before any approval is collected.
pub trait ComplianceGate: Send + Sync {
    fn evaluate(&self, proposal: &CommandProposal) -> ComplianceVerdict;
}

/// Gate that clears every proposal
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearAll;

impl ComplianceGate for ClearAll {
    fn evaluate(&self, _proposal: &CommandProposal) -> ComplianceVerdict {
        ComplianceVerdict::Clear
    }
}

impl<F> ComplianceGate for F
where
    F: Fn(&CommandProposal) -> ComplianceVerdict + Send + Sync,
{
    fn evaluate(&self, proposal: &CommandProposal) -> ComplianceVerdict {
        self(proposal)
    }
}
