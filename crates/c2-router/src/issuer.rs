//! CommandIssuer - turns a satisfied quorum into a signed command.
//!
//! Issuance runs inside the proposal's critical section. The proposal is
//! marked Issued only after the command is fully assembled, self-verified and
//! audited, so a failure at any step leaves it issuable and a concurrent
//! second call always sees either Satisfied or Issued, never both.

use std::sync::{Arc, Mutex};

use killswitch_core::audit::{AuditEvent, AuditLog};
use killswitch_core::config::{IssuerConfig, MAX_COMMAND_TTL_CEILING_SECS};
use killswitch_core::time::Clock;
use killswitch_crypto::{
    CombinedSignature, CryptoError, GroupVerificationKey, KeyCustody, NonceGenerator,
    SignatureShare,
};
use killswitch_domain::{envelope_message, ProposalId, SignedCommand};
use killswitch_identity::{IdentityError, KeyShareStore};
use tracing::{error, info, warn};

use crate::error::{CollectorError, IssueError};
use crate::quorum::{ApprovalCollector, ProposalPhase, QuorumState};

/// Audit source label for issuer entries
pub const ISSUER_SOURCE: &str = "command-issuer";

/// Command lifetime bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuerPolicy {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

impl IssuerPolicy {
    pub fn new(default_ttl_secs: u64, max_ttl_secs: u64) -> Result<Self, IssueError> {
        if max_ttl_secs == 0 || max_ttl_secs > MAX_COMMAND_TTL_CEILING_SECS {
            return Err(IssueError::Config(format!(
                "max_ttl_secs must be within 1..={MAX_COMMAND_TTL_CEILING_SECS}"
            )));
        }
        if default_ttl_secs == 0 || default_ttl_secs > max_ttl_secs {
            return Err(IssueError::Config(
                "default_ttl_secs must be within 1..=max_ttl_secs".to_string(),
            ));
        }
        Ok(Self {
            default_ttl_secs,
            max_ttl_secs,
        })
    }

    pub fn from_config(config: &IssuerConfig) -> Result<Self, IssueError> {
        Self::new(config.default_command_ttl_secs, config.max_command_ttl_secs)
    }
}

/// Issues signed commands from satisfied proposals.
pub struct CommandIssuer {
    collector: Arc<ApprovalCollector>,
    keys: Arc<KeyShareStore>,
    custody: Arc<dyn KeyCustody>,
    group: GroupVerificationKey,
    audit: Arc<AuditLog>,
    nonces: Mutex<NonceGenerator>,
    policy: IssuerPolicy,
}

impl std::fmt::Debug for CommandIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandIssuer")
            .field("issuer_key_id", &self.custody.key_id())
            .field("key_epoch", &self.group.key_epoch)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CommandIssuer {
    /// `group` is the key platforms are provisioned with; its issuer key
    /// must belong to `custody` and `collector` must refuse proposals below
    /// its threshold.
    pub fn new(
        collector: Arc<ApprovalCollector>,
        keys: Arc<KeyShareStore>,
        custody: Arc<dyn KeyCustody>,
        group: GroupVerificationKey,
        audit: Arc<AuditLog>,
        policy: IssuerPolicy,
    ) -> Result<Self, IssueError> {
        if custody.public_key() != group.issuer_key {
            return Err(IssueError::Config(format!(
                "issuer key {} is not the group issuer key",
                custody.key_id()
            )));
        }
        if collector.min_threshold() < group.threshold {
            return Err(IssueError::Config(format!(
                "collector accepts threshold {} below group threshold {}",
                collector.min_threshold(),
                group.threshold
            )));
        }
        info!(
            issuer_key_id = %custody.key_id(),
            key_epoch = group.key_epoch,
            threshold = group.threshold,
            members = group.members.len(),
            group_fingerprint = %group.fingerprint_hex(),
            "Command issuer ready"
        );
        Ok(Self {
            collector,
            keys,
            custody,
            group,
            audit,
            nonces: Mutex::new(NonceGenerator::new()),
            policy,
        })
    }

    /// Group verification key for platform provisioning
    pub fn group_key(&self) -> &GroupVerificationKey {
        &self.group
    }

    pub fn policy(&self) -> IssuerPolicy {
        self.policy
    }

    /// Issue with the default TTL
    pub fn issue(&self, proposal_id: ProposalId) -> Result<SignedCommand, IssueError> {
        self.issue_with_ttl(proposal_id, self.policy.default_ttl_secs)
    }

    /// Issue with an explicit TTL, bounded by the configured maximum
    pub fn issue_with_ttl(
        &self,
        proposal_id: ProposalId,
        ttl_secs: u64,
    ) -> Result<SignedCommand, IssueError> {
        if ttl_secs == 0 {
            return Err(IssueError::ZeroTtl);
        }
        if ttl_secs > self.policy.max_ttl_secs {
            return Err(IssueError::TtlTooLong {
                requested_secs: ttl_secs,
                max_secs: self.policy.max_ttl_secs,
            });
        }

        let slot = self
            .collector
            .slot(&proposal_id)
            .map_err(|_| IssueError::LockPoisoned)?
            .ok_or(IssueError::UnknownProposal { proposal_id })?;
        let mut state = slot.lock().map_err(|_| IssueError::LockPoisoned)?;

        match state.phase() {
            ProposalPhase::Satisfied => {}
            ProposalPhase::Issued { .. } => {
                return Err(self.reject(proposal_id, IssueError::AlreadyIssued { proposal_id }))
            }
            ProposalPhase::Collecting => {
                let err = IssueError::QuorumNotMet {
                    proposal_id,
                    count: state.count(),
                    threshold: state.threshold(),
                };
                return Err(self.reject(proposal_id, err));
            }
            closed => {
                let phase = closed.label();
                return Err(self.reject(proposal_id, IssueError::ProposalClosed { proposal_id, phase }));
            }
        }

        if self.collector.clock().now_ns() > state.deadline_ns() {
            self.collector
                .expire_locked(&mut state)
                .map_err(|e| match e {
                    CollectorError::Audit(audit_error) => IssueError::Audit(audit_error),
                    _ => IssueError::LockPoisoned,
                })?;
            return Err(self.reject(proposal_id, IssueError::ProposalExpired { proposal_id }));
        }

        let shares = self.eligible_shares(&mut state)?;
        let required = state.threshold();
        if shares.len() < required {
            state.set_phase(ProposalPhase::Collecting);
            let err = IssueError::QuorumNotMet {
                proposal_id,
                count: shares.len(),
                threshold: required,
            };
            warn!(proposal_id = %proposal_id, count = shares.len(), required, "Quorum lost before issuance");
            return Err(self.reject(proposal_id, err));
        }

        let command = self.assemble(&state, shares, ttl_secs)?;

        if let Err(e) = command.verify_signature(&self.group) {
            error!(proposal_id = %proposal_id, error = %e, "Issued command failed self-verification");
            return Err(self.reject(proposal_id, IssueError::Crypto(e)));
        }

        self.audit.append(
            ISSUER_SOURCE,
            AuditEvent::CommandIssued {
                proposal_id: proposal_id.to_string(),
                action: command.cmd.to_string(),
                nonce: command.nonce.to_hex(),
                issued_at_ns: command.issued_at_ns,
                ttl_secs: command.ttl_secs,
                key_epoch: command.key_epoch,
                signers: command.combined_signature.signer_ids(),
            },
        )?;
        state.set_phase(ProposalPhase::Issued {
            nonce: command.nonce,
            issued_at_ns: command.issued_at_ns,
        });

        info!(
            proposal_id = %proposal_id,
            action = %command.cmd,
            nonce = %command.nonce,
            ttl_secs,
            signers = command.combined_signature.shares.len(),
            "Command issued"
        );
        Ok(command)
    }

    /// Shares from approvals whose officers are still active and belong to
    /// the provisioned group. Officers revoked since approving are dropped
    /// from the quorum.
    fn eligible_shares(&self, state: &mut QuorumState) -> Result<Vec<SignatureShare>, IssueError> {
        let proposal_id = state.proposal().proposal_id();
        let mut revoked = Vec::new();
        let mut shares = Vec::new();

        for (officer_id, approval) in state.approvals() {
            match self.keys.require_active(officer_id) {
                Ok(_) => {}
                Err(IdentityError::RevokedOfficer { .. }) => {
                    revoked.push(officer_id.clone());
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            if self.group.members.contains_key(officer_id) {
                shares.push(SignatureShare {
                    signer_id: officer_id.clone(),
                    signature: approval.signature.clone(),
                });
            }
        }

        for officer_id in revoked {
            state.drop_approval(&officer_id);
            warn!(proposal_id = %proposal_id, officer_id = %officer_id, "Dropping approval from revoked officer");
            self.audit.append(
                ISSUER_SOURCE,
                AuditEvent::ApprovalRejected {
                    proposal_id: proposal_id.to_string(),
                    officer_id,
                    reason: "officer revoked before issuance".to_string(),
                },
            )?;
        }
        Ok(shares)
    }

    fn assemble(
        &self,
        state: &QuorumState,
        shares: Vec<SignatureShare>,
        ttl_secs: u64,
    ) -> Result<SignedCommand, IssueError> {
        let proposal = state.proposal();
        let nonce = self
            .nonces
            .lock()
            .map_err(|_| IssueError::LockPoisoned)?
            .next_nonce();
        let issued_at_ns = self.collector.clock().now_ns();
        let key_epoch = self.group.key_epoch;
        let fingerprint = self.group.fingerprint();
        let digest = *state.digest();

        let combined_signature =
            CombinedSignature::combine(&self.group, shares, self.custody.as_ref(), |signers| {
                envelope_message(
                    &digest,
                    issued_at_ns,
                    &nonce,
                    ttl_secs,
                    key_epoch,
                    &fingerprint,
                    signers,
                )
            })
            .map_err(|e| match e {
                CryptoError::InsufficientShares { got, required } => IssueError::QuorumNotMet {
                    proposal_id: proposal.proposal_id(),
                    count: got,
                    threshold: required,
                },
                other => IssueError::Crypto(other),
            })?;

        Ok(SignedCommand {
            proposal_id: proposal.proposal_id(),
            cmd: proposal.action(),
            targets: proposal.targets().clone(),
            proposer_id: proposal.proposer_id().to_string(),
            proposed_at_ns: proposal.created_at_ns(),
            context_digest: proposal.context_digest(),
            issued_at_ns,
            nonce,
            ttl_secs,
            key_epoch,
            combined_signature,
        })
    }

    fn reject(&self, proposal_id: ProposalId, error: IssueError) -> IssueError {
        warn!(proposal_id = %proposal_id, error = %error, "Issue rejected");
        match self.audit.append(
            ISSUER_SOURCE,
            AuditEvent::IssueRejected {
                proposal_id: proposal_id.to_string(),
                reason: error.to_string(),
            },
        ) {
            Ok(_) => error,
            Err(audit_error) => IssueError::Audit(audit_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use killswitch_core::time::ManualClock;
    use killswitch_crypto::SoftwareCustody;
    use killswitch_domain::{ActionType, CommandProposal, PartialApproval, TargetSet};
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        keys: Arc<KeyShareStore>,
        audit: Arc<AuditLog>,
        collector: Arc<ApprovalCollector>,
        issuer: CommandIssuer,
        officers: Vec<(String, SoftwareCustody)>,
    }

    fn fixture(m: usize, t: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(5_000_000_000));
        let keys = Arc::new(KeyShareStore::in_memory(clock.clone()));
        let officers: Vec<_> = (0..m)
            .map(|i| {
                let custody = SoftwareCustody::generate();
                let id = format!("officer-{i}");
                keys.enroll(id.clone(), custody.public_key(), "officer").unwrap();
                (id, custody)
            })
            .collect();
        let audit = Arc::new(AuditLog::in_memory("authority", clock.clone()));
        let collector = Arc::new(
            ApprovalCollector::new(keys.clone(), audit.clone(), clock.clone()).with_min_threshold(t),
        );
        let custody = Arc::new(SoftwareCustody::generate());
        let group = keys.group_key(t, custody.public_key(), 1).unwrap();
        let issuer = CommandIssuer::new(
            collector.clone(),
            keys.clone(),
            custody,
            group,
            audit.clone(),
            IssuerPolicy::new(120, 300).unwrap(),
        )
        .unwrap();
        Fixture {
            clock,
            keys,
            audit,
            collector,
            issuer,
            officers,
        }
    }

    fn open_and_approve(f: &Fixture, t: usize, approvers: &[usize]) -> ProposalId {
        let proposal = CommandProposal::new(
            ActionType::ShutdownUnit,
            TargetSet::new().platform("ugv-2"),
            "ops",
            f.clock.now_ns(),
            None,
        )
        .unwrap();
        let id = proposal.proposal_id();
        f.collector.open(proposal.clone(), t, Duration::from_secs(120)).unwrap();
        for &i in approvers {
            let (officer_id, custody) = &f.officers[i];
            let approval =
                PartialApproval::sign(&proposal, officer_id.clone(), custody, f.clock.now_ns())
                    .unwrap();
            f.collector.submit(id, approval).unwrap();
        }
        id
    }

    #[test]
    fn test_issue_once() {
        let f = fixture(3, 2);
        let id = open_and_approve(&f, 2, &[0, 1]);

        let cmd = f.issuer.issue(id).unwrap();
        assert_eq!(cmd.ttl_secs, 120);
        assert_eq!(cmd.issued_at_ns, f.clock.now_ns());
        assert!(cmd.verify_signature(f.issuer.group_key()).is_ok());
        assert!(matches!(
            f.issuer.issue(id),
            Err(IssueError::AlreadyIssued { .. })
        ));
    }

    #[test]
    fn test_issue_requires_quorum() {
        let f = fixture(3, 2);
        let id = open_and_approve(&f, 2, &[0]);
        assert!(matches!(
            f.issuer.issue(id),
            Err(IssueError::QuorumNotMet { count: 1, threshold: 2, .. })
        ));
        assert!(matches!(
            f.issuer.issue(ProposalId::new()),
            Err(IssueError::UnknownProposal { .. })
        ));
    }

    #[test]
    fn test_ttl_bounds() {
        let f = fixture(2, 1);
        let id = open_and_approve(&f, 1, &[0]);
        assert!(matches!(
            f.issuer.issue_with_ttl(id, 301),
            Err(IssueError::TtlTooLong { requested_secs: 301, max_secs: 300 })
        ));
        assert!(matches!(f.issuer.issue_with_ttl(id, 0), Err(IssueError::ZeroTtl)));
        assert_eq!(f.issuer.issue_with_ttl(id, 30).unwrap().ttl_secs, 30);
        assert!(IssuerPolicy::new(120, 3600).is_err());
        assert!(IssuerPolicy::new(600, 300).is_err());
    }

    #[test]
    fn test_revoked_after_approval_drops_share() {
        let f = fixture(3, 2);
        let id = open_and_approve(&f, 2, &[0, 1]);
        f.keys.revoke("officer-1", "compromised").unwrap();

        assert!(matches!(
            f.issuer.issue(id),
            Err(IssueError::QuorumNotMet { count: 1, threshold: 2, .. })
        ));
        let state = f.collector.status(id).unwrap();
        assert_eq!(state.phase(), &ProposalPhase::Collecting);
        assert_eq!(state.count(), 1);

        let proposal = state.proposal().clone();
        let (officer_id, custody) = &f.officers[2];
        let approval = PartialApproval::sign(&proposal, officer_id.clone(), custody, 0).unwrap();
        assert!(f.collector.submit(id, approval).unwrap().newly_satisfied);

        let cmd = f.issuer.issue(id).unwrap();
        assert_eq!(
            cmd.combined_signature.signer_ids(),
            vec!["officer-0".to_string(), "officer-2".to_string()]
        );
    }

    #[test]
    fn test_issue_after_deadline_expires() {
        let f = fixture(2, 1);
        let id = open_and_approve(&f, 1, &[0]);
        f.clock.advance(Duration::from_secs(121));
        assert!(matches!(
            f.issuer.issue(id),
            Err(IssueError::ProposalExpired { .. })
        ));
        assert_eq!(f.collector.status(id).unwrap().phase(), &ProposalPhase::Expired);
    }

    #[test]
    fn test_aborted_proposal_cannot_issue() {
        let f = fixture(2, 1);
        let id = open_and_approve(&f, 1, &[0]);
        f.collector.abort(id, "called off").unwrap();
        assert!(matches!(
            f.issuer.issue(id),
            Err(IssueError::ProposalClosed { phase: "aborted", .. })
        ));
    }

    #[test]
    fn test_issuance_is_audited() {
        let f = fixture(2, 1);
        let id = open_and_approve(&f, 1, &[0]);
        let cmd = f.issuer.issue(id).unwrap();

        let entries = f.audit.entries().unwrap();
        let last = entries.last().unwrap();
        match &last.event {
            AuditEvent::CommandIssued { nonce, signers, .. } => {
                assert_eq!(nonce, &cmd.nonce.to_hex());
                assert_eq!(signers, &vec!["officer-0".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_issuer_key_rejected() {
        let f = fixture(2, 1);
        let group = f.issuer.group_key().clone();
        assert!(matches!(
            CommandIssuer::new(
                f.collector.clone(),
                f.keys.clone(),
                Arc::new(SoftwareCustody::generate()),
                group,
                f.audit.clone(),
                IssuerPolicy::new(60, 60).unwrap(),
            ),
            Err(IssueError::Config(_))
        ));
    }

    #[test]
    fn test_threshold_below_group_is_refused() {
        let f = fixture(3, 2);
        let proposal = CommandProposal::new(
            ActionType::ShutdownUnit,
            TargetSet::new().platform("ugv-2"),
            "ops",
            f.clock.now_ns(),
            None,
        )
        .unwrap();
        assert!(matches!(
            f.collector.open(proposal, 1, Duration::from_secs(60)),
            Err(CollectorError::ThresholdBelowGroup {
                threshold: 1,
                required: 2
            })
        ));

        // A collector that would accept t=1 cannot back a 2-of-n issuer
        let lax = Arc::new(ApprovalCollector::new(
            f.keys.clone(),
            f.audit.clone(),
            f.clock.clone(),
        ));
        assert!(matches!(
            CommandIssuer::new(
                lax,
                f.keys.clone(),
                Arc::new(SoftwareCustody::generate()),
                f.issuer.group_key().clone(),
                f.audit.clone(),
                IssuerPolicy::new(60, 60).unwrap(),
            ),
            Err(IssueError::Config(_))
        ));
    }
}
