//! Shared fixtures: an authority (officers, collector, issuer) and receiving
//! platforms, all driven by one manual clock.

use std::sync::Arc;
use std::time::Duration;

use killswitch_c2_router::{
    ApprovalCollector, CollectorError, CommandIssuer, IssuerPolicy, QuorumStatus,
};
use killswitch_core::{AuditLog, Clock, ManualClock};
use killswitch_crypto::{GroupVerificationKey, KeyCustody, SoftwareCustody};
use killswitch_domain::{ActionType, CommandProposal, PartialApproval, TargetSet};
use killswitch_edge::{
    CommandVerifier, FailsafeController, FailsafePolicy, NonceLedger, PlatformPolicy, ResumeToken,
};
use killswitch_identity::KeyShareStore;

/// 2023-11-14T22:13:20Z
pub const START_NS: u64 = 1_700_000_000_000_000_000;

pub const KEY_EPOCH: u64 = 1;

/// An enrolled officer and their signing device
pub struct Officer {
    pub id: String,
    pub custody: SoftwareCustody,
}

/// Authority side: key share store, approval collector and command issuer
pub struct Authority {
    pub clock: Arc<ManualClock>,
    pub keys: Arc<KeyShareStore>,
    pub audit: Arc<AuditLog>,
    pub collector: Arc<ApprovalCollector>,
    pub issuer: CommandIssuer,
    pub officers: Vec<Officer>,
}

impl Authority {
    /// `m` officers named `officer-a`, `officer-b`, ... and a group key with threshold `t`
    pub fn new(m: usize, t: usize) -> Self {
        Self::with_clock(m, t, Arc::new(ManualClock::new(START_NS)))
    }

    pub fn with_clock(m: usize, t: usize, clock: Arc<ManualClock>) -> Self {
        let keys = Arc::new(KeyShareStore::in_memory(clock.clone()));
        let officers: Vec<_> = (0..m)
            .map(|i| {
                let id = format!("officer-{}", (b'a' + i as u8) as char);
                let custody = SoftwareCustody::generate();
                keys.enroll(id.clone(), custody.public_key(), "officer")
                    .unwrap();
                Officer { id, custody }
            })
            .collect();

        let audit = Arc::new(AuditLog::in_memory("authority", clock.clone()));
        let collector = Arc::new(
            ApprovalCollector::new(keys.clone(), audit.clone(), clock.clone())
                .with_min_threshold(t),
        );
        let issuer_custody = Arc::new(SoftwareCustody::generate());
        let group = keys
            .group_key(t, issuer_custody.public_key(), KEY_EPOCH)
            .unwrap();
        let issuer = CommandIssuer::new(
            collector.clone(),
            keys.clone(),
            issuer_custody,
            group,
            audit.clone(),
            IssuerPolicy::new(120, 300).unwrap(),
        )
        .unwrap();

        Self {
            clock,
            keys,
            audit,
            collector,
            issuer,
            officers,
        }
    }

    /// Officer by letter, e.g. `officer('c')`
    pub fn officer(&self, letter: char) -> &Officer {
        let id = format!("officer-{letter}");
        self.officers
            .iter()
            .find(|o| o.id == id)
            .unwrap_or_else(|| panic!("no {id}"))
    }

    pub fn group_key(&self) -> GroupVerificationKey {
        self.issuer.group_key().clone()
    }

    /// Open a proposal with a 120 s collection window
    pub fn open(&self, action: ActionType, targets: TargetSet, t: usize) -> CommandProposal {
        let proposal =
            CommandProposal::new(action, targets, "ops-center", self.clock.now_ns(), None)
                .unwrap();
        self.collector
            .open(proposal.clone(), t, Duration::from_secs(120))
            .unwrap();
        proposal
    }

    pub fn approval(&self, proposal: &CommandProposal, letter: char) -> PartialApproval {
        let officer = self.officer(letter);
        PartialApproval::sign(
            proposal,
            officer.id.clone(),
            &officer.custody,
            self.clock.now_ns(),
        )
        .unwrap()
    }

    pub fn approve(
        &self,
        proposal: &CommandProposal,
        letter: char,
    ) -> Result<QuorumStatus, CollectorError> {
        self.collector
            .submit(proposal.proposal_id(), self.approval(proposal, letter))
    }
}

/// One receiving platform
pub struct Platform {
    pub clock: Arc<ManualClock>,
    pub audit: Arc<AuditLog>,
    pub ledger: Arc<NonceLedger>,
    pub failsafe: Arc<FailsafeController>,
    pub verifier: CommandVerifier,
    pub reset_authority: SoftwareCustody,
    pub watch_officer: SoftwareCustody,
}

impl Platform {
    /// Platform accepting every action, suspicion threshold 3 within 60 s
    pub fn new(
        platform_id: &str,
        fleet_id: Option<&str>,
        group: GroupVerificationKey,
        clock: Arc<ManualClock>,
    ) -> Self {
        let policy = PlatformPolicy {
            platform_id: platform_id.to_string(),
            fleet_id: fleet_id.map(str::to_string),
            accepted_actions: ActionType::ALL.into_iter().collect(),
            max_command_ttl_secs: 300,
            max_clock_skew_secs: 5,
            rate_limit_window_secs: 10,
            rate_limit_max_commands: 50,
        };
        let ledger = Arc::new(NonceLedger::in_memory(policy.nonce_retention(), 10_000));
        Self::with_parts(policy, group, ledger, clock)
    }

    pub fn with_parts(
        policy: PlatformPolicy,
        group: GroupVerificationKey,
        ledger: Arc<NonceLedger>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let audit = Arc::new(AuditLog::in_memory(
            policy.platform_id.clone(),
            clock.clone(),
        ));
        let reset_authority = SoftwareCustody::generate();
        let watch_officer = SoftwareCustody::generate();
        let failsafe = Arc::new(FailsafeController::new(
            policy.platform_id.clone(),
            FailsafePolicy {
                suspicion_threshold: 3,
                suspicion_window: Duration::from_secs(60),
                reset_authority: Some(reset_authority.public_key()),
                resume_authority: Some(watch_officer.public_key()),
            },
            audit.clone(),
            clock.clone(),
        ));
        let verifier = CommandVerifier::new(
            policy,
            group,
            ledger.clone(),
            failsafe.clone(),
            audit.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            clock,
            audit,
            ledger,
            failsafe,
            verifier,
            reset_authority,
            watch_officer,
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Watch-officer token for the current hold
    pub fn resume_token(&self, operator_id: &str) -> ResumeToken {
        let hold_seq = self.failsafe.hold_seq().unwrap();
        ResumeToken::sign(
            &self.verifier.policy().platform_id,
            operator_id,
            hold_seq,
            &self.watch_officer,
        )
        .unwrap()
    }
}

/// Open, approve with the first `t` officers, and issue an ENGAGE for `platform_id`
pub fn issue_engage(authority: &Authority, platform_id: &str, t: usize) -> killswitch_domain::SignedCommand {
    let proposal = authority.open(
        ActionType::Engage,
        TargetSet::new().platform(platform_id).designator("T1"),
        t,
    );
    let letters: Vec<char> = authority
        .officers
        .iter()
        .filter_map(|o| o.id.strip_prefix("officer-").and_then(|s| s.chars().next()))
        .collect();
    for &letter in letters.iter().take(t) {
        authority.approve(&proposal, letter).unwrap();
    }
    authority.issuer.issue(proposal.proposal_id()).unwrap()
}
