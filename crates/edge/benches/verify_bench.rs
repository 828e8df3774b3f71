//! Platform verification path benchmarks
//!
//! Measures the cost of what every delivered command pays on the platform:
//! - Combined signature verification for growing quorum sizes
//! - Nonce ledger insert-if-absent
//! - Full CommandVerifier pass (signature, window, replay, applicability, audit)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use killswitch_core::{AuditLog, ManualClock};
use killswitch_crypto::{
    CombinedSignature, GroupVerificationKey, KeyCustody, Nonce, NonceGenerator, SignatureShare,
    SoftwareCustody,
};
use killswitch_domain::{
    envelope_message, ActionType, CommandProposal, PartialApproval, SignedCommand, TargetSet,
};
use killswitch_edge::{
    CommandVerifier, FailsafeController, FailsafePolicy, NonceLedger, PlatformPolicy,
};

const START_NS: u64 = 1_700_000_000_000_000_000;

/// `m` enrolled officers with threshold `t`, plus the issuer key
struct Signers {
    officers: Vec<(String, SoftwareCustody)>,
    issuer: SoftwareCustody,
    group: GroupVerificationKey,
    nonces: NonceGenerator,
}

impl Signers {
    fn new(m: usize, t: usize) -> Self {
        let officers: Vec<_> = (0..m)
            .map(|i| (format!("officer-{i}"), SoftwareCustody::generate()))
            .collect();
        let issuer = SoftwareCustody::generate();
        let members: BTreeMap<_, _> = officers
            .iter()
            .map(|(id, c)| (id.clone(), c.public_key()))
            .collect();
        let group = GroupVerificationKey::new(1, t, members, issuer.public_key()).unwrap();
        Self {
            officers,
            issuer,
            group,
            nonces: NonceGenerator::new(),
        }
    }

    /// Command approved by the first `t` officers
    fn command(&mut self) -> SignedCommand {
        let proposal = CommandProposal::new(
            ActionType::ShutdownUnit,
            TargetSet::new().platform("uav-1"),
            "ops",
            START_NS,
            None,
        )
        .unwrap();
        let shares = self.officers[..self.group.threshold]
            .iter()
            .map(|(id, c)| {
                let approval = PartialApproval::sign(&proposal, id.clone(), c, START_NS).unwrap();
                SignatureShare {
                    signer_id: approval.officer_id,
                    signature: approval.signature,
                }
            })
            .collect();

        let nonce = self.nonces.next_nonce();
        let digest = proposal.digest();
        let fingerprint = self.group.fingerprint();
        let combined = CombinedSignature::combine(&self.group, shares, &self.issuer, |ids| {
            envelope_message(&digest, START_NS, &nonce, 120, 1, &fingerprint, ids)
        })
        .unwrap();

        SignedCommand {
            proposal_id: proposal.proposal_id(),
            cmd: proposal.action(),
            targets: proposal.targets().clone(),
            proposer_id: proposal.proposer_id().to_string(),
            proposed_at_ns: proposal.created_at_ns(),
            context_digest: proposal.context_digest(),
            issued_at_ns: START_NS,
            nonce,
            ttl_secs: 120,
            key_epoch: 1,
            combined_signature: combined,
        }
    }
}

/// Benchmark: combined signature verification by quorum size
fn bench_signature_verification(c: &mut Criterion) {
    for (m, t) in [(3, 2), (5, 3), (9, 5), (15, 8)] {
        let mut signers = Signers::new(m, t);
        let command = signers.command();
        c.bench_with_input(
            BenchmarkId::new("combined_signature_verify", format!("{t}_of_{m}")),
            &command,
            |b, command| b.iter(|| black_box(command.verify_signature(&signers.group).is_ok())),
        );
    }
}

/// Benchmark: nonce ledger insert-if-absent
fn bench_nonce_ledger_insert(c: &mut Criterion) {
    let ledger = NonceLedger::in_memory(Duration::from_secs(300), usize::MAX);
    let mut counter: u128 = 0;

    c.bench_function("nonce_ledger_insert", |b| {
        b.iter(|| {
            counter += 1;
            let nonce = Nonce(counter.to_be_bytes());
            black_box(ledger.check_and_insert("uav-1", &nonce, START_NS).unwrap())
        })
    });

    let seen = Nonce([0xAB; 16]);
    ledger.check_and_insert("uav-1", &seen, START_NS).unwrap();
    c.bench_function("nonce_ledger_replay_hit", |b| {
        b.iter(|| black_box(ledger.check_and_insert("uav-1", &seen, START_NS).unwrap()))
    });
}

/// Benchmark: full verification of fresh commands
fn bench_full_verification(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(START_NS));
    let audit = Arc::new(AuditLog::in_memory("bench", clock.clone()));
    let failsafe = Arc::new(FailsafeController::new(
        "uav-1",
        FailsafePolicy {
            suspicion_threshold: 3,
            suspicion_window: Duration::from_secs(60),
            reset_authority: None,
            resume_authority: None,
        },
        audit.clone(),
        clock.clone(),
    ));
    let policy = PlatformPolicy {
        platform_id: "uav-1".to_string(),
        fleet_id: None,
        accepted_actions: ActionType::ALL.into_iter().collect(),
        max_command_ttl_secs: 300,
        max_clock_skew_secs: 5,
        rate_limit_window_secs: 1,
        rate_limit_max_commands: usize::MAX,
    };
    let ledger = Arc::new(NonceLedger::in_memory(policy.nonce_retention(), usize::MAX));

    let mut signers = Signers::new(5, 3);
    let verifier = CommandVerifier::new(
        policy,
        signers.group.clone(),
        ledger,
        failsafe,
        audit,
        clock,
    )
    .unwrap();

    // Signing a fresh command per iteration is setup, not measured
    c.bench_function("verify_fresh_command", |b| {
        b.iter_batched(
            || signers.command(),
            |command| black_box(verifier.verify(&command).state),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_signature_verification,
    bench_nonce_ledger_insert,
    bench_full_verification,
);

criterion_main!(benches);
