//! ApprovalCollector - gathers officer approvals and tracks quorum progress.
//!
//! Each proposal owns its own [`QuorumState`] behind a dedicated mutex. A
//! submission verifies the approval, records it in the audit log and checks
//! the threshold while holding that mutex, so two concurrent submissions can
//! never both observe "quorum newly reached". Different proposals never
//! contend with each other beyond a short read lock on the proposal index.
//!
//! # Phases
//!
//! ```text
//! Collecting --(t distinct valid approvals)--> Satisfied --(issue)--> Issued
//!     |                                            |
//!     +--(deadline passes)--> Expired <------------+
//!     +--(abort)------------> Aborted <------------+
//! ```
//!
//! Terminal proposals stay in the index so their ids remain reserved.

#![warn(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use killswitch_core::audit::{AuditEvent, AuditLog};
use killswitch_core::time::{duration_to_ns, Clock};
use killswitch_crypto::{Digest, Nonce};
use killswitch_domain::{approval_message, CommandProposal, PartialApproval, ProposalId};
use killswitch_identity::KeyShareStore;
use tracing::{info, warn};

use crate::compliance::{ClearAll, ComplianceGate, ComplianceVerdict};
use crate::error::CollectorError;

/// Audit source label for collector entries
pub const COLLECTOR_SOURCE: &str = "approval-collector";

/// Lifecycle phase of a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalPhase {
    /// Accepting approvals
    Collecting,
    /// Threshold reached, waiting for issuance
    Satisfied,
    /// Signed command produced; terminal
    Issued {
        /// Nonce of the issued command
        nonce: Nonce,
        /// Issuance time (nanoseconds since epoch)
        issued_at_ns: u64,
    },
    /// Explicitly aborted; terminal
    Aborted {
        /// Operator-supplied reason
        reason: String,
    },
    /// Deadline passed before issuance; terminal
    Expired,
}

impl ProposalPhase {
    /// Stable label for logs and errors
    pub fn label(&self) -> &'static str {
        match self {
            ProposalPhase::Collecting => "collecting",
            ProposalPhase::Satisfied => "satisfied",
            ProposalPhase::Issued { .. } => "issued",
            ProposalPhase::Aborted { .. } => "aborted",
            ProposalPhase::Expired => "expired",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalPhase::Issued { .. } | ProposalPhase::Aborted { .. } | ProposalPhase::Expired
        )
    }
}

/// Quorum progress for one proposal. Mutated only by the collector and,
/// at issuance, by the issuer while holding the proposal's lock.
#[derive(Debug, Clone)]
pub struct QuorumState {
    proposal: CommandProposal,
    digest: Digest,
    threshold: usize,
    enrolled: usize,
    opened_at_ns: u64,
    deadline_ns: u64,
    approvals: BTreeMap<String, PartialApproval>,
    phase: ProposalPhase,
}

impl QuorumState {
    /// The proposal being approved
    pub fn proposal(&self) -> &CommandProposal {
        &self.proposal
    }

    /// Canonical proposal digest officers sign
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Required number of distinct approvals (t)
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Enrolled officers when the proposal was opened (M)
    pub fn enrolled(&self) -> usize {
        self.enrolled
    }

    /// Open time (nanoseconds since epoch)
    pub fn opened_at_ns(&self) -> u64 {
        self.opened_at_ns
    }

    /// Collection deadline (nanoseconds since epoch)
    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns
    }

    /// Accepted approvals by officer id
    pub fn approvals(&self) -> &BTreeMap<String, PartialApproval> {
        &self.approvals
    }

    /// Number of accepted approvals
    pub fn count(&self) -> usize {
        self.approvals.len()
    }

    /// Current phase
    pub fn phase(&self) -> &ProposalPhase {
        &self.phase
    }

    /// Whether the threshold has been reached and not yet consumed
    pub fn is_satisfied(&self) -> bool {
        self.phase == ProposalPhase::Satisfied
    }

    pub(crate) fn set_phase(&mut self, phase: ProposalPhase) {
        self.phase = phase;
    }

    pub(crate) fn drop_approval(&mut self, officer_id: &str) -> Option<PartialApproval> {
        self.approvals.remove(officer_id)
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumStatus {
    /// Proposal the approval was counted toward
    pub proposal_id: ProposalId,
    /// Accepted approvals after this submission
    pub count: usize,
    /// Required threshold
    pub threshold: usize,
    /// Whether quorum is reached
    pub satisfied: bool,
    /// True for exactly one submission per proposal: the one that reached quorum
    pub newly_satisfied: bool,
}

pub(crate) type ProposalSlot = Arc<Mutex<QuorumState>>;

/// Collects partial approvals for open proposals.
pub struct ApprovalCollector {
    keys: Arc<KeyShareStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    gate: Arc<dyn ComplianceGate>,
    min_threshold: usize,
    proposals: RwLock<HashMap<ProposalId, ProposalSlot>>,
}

impl std::fmt::Debug for ApprovalCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalCollector")
            .field("audit_log", &self.audit.log_id())
            .finish_non_exhaustive()
    }
}

impl ApprovalCollector {
    /// Create a collector that clears every proposal at the compliance gate
    pub fn new(keys: Arc<KeyShareStore>, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            audit,
            clock,
            gate: Arc::new(ClearAll),
            min_threshold: 1,
            proposals: RwLock::new(HashMap::new()),
        }
    }

    /// Refuse proposals whose threshold is below `min_threshold`. Set this to
    /// the threshold platforms are provisioned with so a proposal can never
    /// report quorum the issuer will not honour.
    pub fn with_min_threshold(mut self, min_threshold: usize) -> Self {
        self.min_threshold = min_threshold.max(1);
        self
    }

    pub fn min_threshold(&self) -> usize {
        self.min_threshold
    }

    /// Replace the compliance gate consulted by [`open`](Self::open)
    pub fn with_compliance_gate(mut self, gate: Arc<dyn ComplianceGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Open a proposal for approval with threshold `t` and a collection window of `ttl`.
    pub fn open(
        &self,
        proposal: CommandProposal,
        threshold: usize,
        ttl: Duration,
    ) -> Result<QuorumState, CollectorError> {
        let proposal_id = proposal.proposal_id();
        proposal.validate()?;

        let active = self.keys.active_count()?;
        if threshold == 0 || threshold > active {
            return Err(CollectorError::InvalidThreshold { threshold, active });
        }
        if threshold < self.min_threshold {
            return Err(CollectorError::ThresholdBelowGroup {
                threshold,
                required: self.min_threshold,
            });
        }
        let ttl_ns = duration_to_ns(ttl);
        if ttl_ns == 0 {
            return Err(CollectorError::InvalidWindow(
                "collection window must be non-zero".to_string(),
            ));
        }

        if let ComplianceVerdict::Veto { reason } = self.gate.evaluate(&proposal) {
            warn!(proposal_id = %proposal_id, reason = %reason, "Proposal vetoed by compliance gate");
            self.audit.append(
                COLLECTOR_SOURCE,
                AuditEvent::ProposalVetoed {
                    proposal_id: proposal_id.to_string(),
                    reason: reason.clone(),
                },
            )?;
            return Err(CollectorError::ComplianceVeto { reason });
        }

        let mut proposals = self
            .proposals
            .write()
            .map_err(|_| CollectorError::LockPoisoned)?;
        if proposals.contains_key(&proposal_id) {
            return Err(CollectorError::DuplicateProposal { proposal_id });
        }

        let now = self.clock.now_ns();
        let state = QuorumState {
            digest: proposal.digest(),
            threshold,
            enrolled: self.keys.enrolled_count()?,
            opened_at_ns: now,
            deadline_ns: now.saturating_add(ttl_ns),
            approvals: BTreeMap::new(),
            phase: ProposalPhase::Collecting,
            proposal,
        };

        self.audit.append(
            COLLECTOR_SOURCE,
            AuditEvent::ProposalOpened {
                proposal_id: proposal_id.to_string(),
                action: state.proposal.action().to_string(),
                proposer_id: state.proposal.proposer_id().to_string(),
                threshold,
                deadline_ns: state.deadline_ns,
            },
        )?;
        proposals.insert(proposal_id, Arc::new(Mutex::new(state.clone())));

        info!(
            proposal_id = %proposal_id,
            action = %state.proposal.action(),
            threshold,
            enrolled = state.enrolled,
            "Proposal opened"
        );
        Ok(state)
    }

    /// Submit one officer's approval.
    ///
    /// Checks run in order: proposal known, still collecting, deadline,
    /// officer enrolled, officer not revoked, no prior approval from the
    /// officer, signature. The first approval from an officer to be durably
    /// recorded wins; any later one is a `DuplicateApproval`.
    pub fn submit(
        &self,
        proposal_id: ProposalId,
        approval: PartialApproval,
    ) -> Result<QuorumStatus, CollectorError> {
        let officer_id = approval.officer_id.clone();

        let Some(slot) = self.slot(&proposal_id)? else {
            return Err(self.reject(
                &proposal_id,
                &officer_id,
                CollectorError::UnknownProposal { proposal_id },
            ));
        };
        let mut state = slot.lock().map_err(|_| CollectorError::LockPoisoned)?;

        if approval.proposal_id != proposal_id {
            return Err(self.reject(
                &proposal_id,
                &officer_id,
                CollectorError::ProposalMismatch {
                    expected: proposal_id,
                    actual: approval.proposal_id,
                },
            ));
        }

        match state.phase {
            ProposalPhase::Collecting => {}
            ProposalPhase::Expired => {
                return Err(self.reject(
                    &proposal_id,
                    &officer_id,
                    CollectorError::ProposalExpired { proposal_id },
                ))
            }
            ref closed => {
                let phase = closed.label();
                return Err(self.reject(
                    &proposal_id,
                    &officer_id,
                    CollectorError::ProposalClosed { proposal_id, phase },
                ));
            }
        }

        if self.clock.now_ns() > state.deadline_ns {
            self.expire_locked(&mut state)?;
            return Err(self.reject(
                &proposal_id,
                &officer_id,
                CollectorError::ProposalExpired { proposal_id },
            ));
        }

        if let Err(e) = self.keys.require_active(&officer_id) {
            return Err(self.reject(&proposal_id, &officer_id, e.into()));
        }
        if state.approvals.contains_key(&officer_id) {
            return Err(self.reject(
                &proposal_id,
                &officer_id,
                CollectorError::DuplicateApproval {
                    officer_id: officer_id.clone(),
                },
            ));
        }
        if let Err(e) = self.keys.verify_approval(
            &officer_id,
            &approval_message(&state.digest),
            &approval.signature,
        ) {
            return Err(self.reject(&proposal_id, &officer_id, e.into()));
        }

        let count = state.approvals.len() + 1;
        self.audit.append(
            COLLECTOR_SOURCE,
            AuditEvent::ApprovalAccepted {
                proposal_id: proposal_id.to_string(),
                officer_id: officer_id.clone(),
                count,
                threshold: state.threshold,
            },
        )?;
        state.approvals.insert(officer_id.clone(), approval);

        info!(
            proposal_id = %proposal_id,
            officer_id = %officer_id,
            count,
            threshold = state.threshold,
            "Approval accepted"
        );

        let newly_satisfied = count >= state.threshold;
        if newly_satisfied {
            state.phase = ProposalPhase::Satisfied;
            info!(proposal_id = %proposal_id, count, "Quorum satisfied");
            self.audit.append(
                COLLECTOR_SOURCE,
                AuditEvent::QuorumSatisfied {
                    proposal_id: proposal_id.to_string(),
                    count,
                },
            )?;
        }

        Ok(QuorumStatus {
            proposal_id,
            count,
            threshold: state.threshold,
            satisfied: state.is_satisfied(),
            newly_satisfied,
        })
    }

    /// Abort a proposal. Approvals already accepted remain in the audit trail.
    pub fn abort(&self, proposal_id: ProposalId, reason: &str) -> Result<(), CollectorError> {
        let slot = self
            .slot(&proposal_id)?
            .ok_or(CollectorError::UnknownProposal { proposal_id })?;
        let mut state = slot.lock().map_err(|_| CollectorError::LockPoisoned)?;

        if state.phase.is_terminal() {
            return Err(CollectorError::ProposalClosed {
                proposal_id,
                phase: state.phase.label(),
            });
        }

        self.audit.append(
            COLLECTOR_SOURCE,
            AuditEvent::ProposalAborted {
                proposal_id: proposal_id.to_string(),
                reason: reason.to_string(),
            },
        )?;
        state.phase = ProposalPhase::Aborted {
            reason: reason.to_string(),
        };

        warn!(proposal_id = %proposal_id, reason, count = state.count(), "Proposal aborted");
        Ok(())
    }

    /// Expire every non-terminal proposal whose deadline has passed.
    /// Returns the ids that moved to Expired.
    pub fn expire_overdue(&self) -> Result<Vec<ProposalId>, CollectorError> {
        let now = self.clock.now_ns();
        let slots: Vec<(ProposalId, ProposalSlot)> = self
            .proposals
            .read()
            .map_err(|_| CollectorError::LockPoisoned)?
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut expired = Vec::new();
        for (proposal_id, slot) in slots {
            let mut state = slot.lock().map_err(|_| CollectorError::LockPoisoned)?;
            if !state.phase.is_terminal() && now > state.deadline_ns {
                self.expire_locked(&mut state)?;
                expired.push(proposal_id);
            }
        }
        Ok(expired)
    }

    /// Snapshot of a proposal's quorum state
    pub fn status(&self, proposal_id: ProposalId) -> Result<QuorumState, CollectorError> {
        let slot = self
            .slot(&proposal_id)?
            .ok_or(CollectorError::UnknownProposal { proposal_id })?;
        let state = slot.lock().map_err(|_| CollectorError::LockPoisoned)?;
        Ok(state.clone())
    }

    /// Number of proposals in the index, terminal ones included
    pub fn proposal_count(&self) -> Result<usize, CollectorError> {
        Ok(self
            .proposals
            .read()
            .map_err(|_| CollectorError::LockPoisoned)?
            .len())
    }

    pub(crate) fn slot(&self, proposal_id: &ProposalId) -> Result<Option<ProposalSlot>, CollectorError> {
        Ok(self
            .proposals
            .read()
            .map_err(|_| CollectorError::LockPoisoned)?
            .get(proposal_id)
            .cloned())
    }

    pub(crate) fn expire_locked(&self, state: &mut QuorumState) -> Result<(), CollectorError> {
        let proposal_id = state.proposal.proposal_id();
        self.audit.append(
            COLLECTOR_SOURCE,
            AuditEvent::ProposalExpired {
                proposal_id: proposal_id.to_string(),
                count: state.count(),
            },
        )?;
        state.phase = ProposalPhase::Expired;
        warn!(proposal_id = %proposal_id, count = state.count(), "Proposal expired");
        Ok(())
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Audit the rejection. If the audit record itself cannot be written the
    /// caller gets the audit failure instead.
    fn reject(
        &self,
        proposal_id: &ProposalId,
        officer_id: &str,
        error: CollectorError,
    ) -> CollectorError {
        warn!(
            proposal_id = %proposal_id,
            officer_id,
            error = %error,
            "Approval rejected"
        );
        match self.audit.append(
            COLLECTOR_SOURCE,
            AuditEvent::ApprovalRejected {
                proposal_id: proposal_id.to_string(),
                officer_id: officer_id.to_string(),
                reason: error.to_string(),
            },
        ) {
            Ok(_) => error,
            Err(audit_error) => CollectorError::Audit(audit_error),
        }
    }
}
