//! End-to-end scenarios: officers approve, the issuer signs, platforms verify.

use std::time::Duration;

use killswitch_c2_router::{CollectorError, IssueError, ProposalPhase};
use killswitch_core::time::{secs_to_ns, Clock};
use killswitch_core::AuditEvent;
use killswitch_crypto::{CombinedSignature, KeyCustody, NonceGenerator, SignatureShare};
use killswitch_domain::{envelope_message, ActionType, SignedCommand, TargetSet};
use killswitch_edge::{
    CommandState, FailsafeError, FailsafeMode, ResetToken, SuspicionKind, VerifyError,
};

use crate::test_utils::*;

#[test]
fn test_three_of_five_with_revoked_officer() {
    let authority = Authority::new(5, 3);
    authority
        .keys
        .revoke("officer-c", "lost signing device")
        .unwrap();

    let proposal = authority.open(
        ActionType::Engage,
        TargetSet::new().platform("uav-1").designator("T1"),
        3,
    );

    let a = authority.approve(&proposal, 'a').unwrap();
    assert_eq!((a.count, a.satisfied), (1, false));
    let b = authority.approve(&proposal, 'b').unwrap();
    assert_eq!((b.count, b.satisfied), (2, false));

    assert!(matches!(
        authority.approve(&proposal, 'c'),
        Err(CollectorError::RevokedOfficer { .. })
    ));
    let status = authority.collector.status(proposal.proposal_id()).unwrap();
    assert_eq!(status.count(), 2);

    let d = authority.approve(&proposal, 'd').unwrap();
    assert_eq!(d.count, 3);
    assert!(d.satisfied);
    assert!(d.newly_satisfied);

    let command = authority.issuer.issue(proposal.proposal_id()).unwrap();
    assert_eq!(command.cmd, ActionType::Engage);
    assert_eq!(
        command.combined_signature.signer_ids(),
        vec!["officer-a", "officer-b", "officer-d"]
    );
    assert!(command.verify_signature(&authority.group_key()).is_ok());

    assert!(matches!(
        authority.issuer.issue(proposal.proposal_id()),
        Err(IssueError::AlreadyIssued { .. })
    ));
    assert!(matches!(
        authority
            .collector
            .status(proposal.proposal_id())
            .unwrap()
            .phase(),
        ProposalPhase::Issued { .. }
    ));
}

#[test]
fn test_issue_before_quorum_and_duplicate_approval() {
    let authority = Authority::new(5, 3);
    let proposal = authority.open(
        ActionType::ShutdownUnit,
        TargetSet::new().platform("ugv-4"),
        3,
    );
    authority.approve(&proposal, 'a').unwrap();

    assert!(matches!(
        authority.approve(&proposal, 'a'),
        Err(CollectorError::DuplicateApproval { .. })
    ));
    assert!(matches!(
        authority.issuer.issue(proposal.proposal_id()),
        Err(IssueError::QuorumNotMet {
            count: 1,
            threshold: 3,
            ..
        })
    ));
}

#[test]
fn test_delivered_twice_is_replay() {
    let authority = Authority::new(5, 3);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());
    let command = issue_engage(&authority, "uav-1", 3);

    let first = platform.verifier.verify(&command);
    assert_eq!(first.state, CommandState::Execute);

    let second = platform.verifier.verify(&command);
    assert_eq!(second.state, CommandState::HoldFire);
    assert!(matches!(
        second.error(),
        Some(VerifyError::ReplayDetected { .. })
    ));
    assert_eq!(platform.failsafe.mode().unwrap(), FailsafeMode::HoldFire);

    // Only a signed watch-officer token lifts the hold
    let mut forged = platform.resume_token("watch-officer");
    forged.signature = vec![0u8; 64];
    assert!(matches!(
        platform.failsafe.resume(&forged),
        Err(FailsafeError::InvalidResumeToken(_))
    ));
    platform
        .failsafe
        .resume(&platform.resume_token("watch-officer"))
        .unwrap();
    assert!(platform
        .verifier
        .verify(&issue_engage(&authority, "uav-1", 3))
        .is_execute());
}

#[test]
fn test_wire_roundtrip_then_replay() {
    let authority = Authority::new(3, 2);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());
    let command = issue_engage(&authority, "uav-1", 2);

    let wire = serde_json::to_string(&command).unwrap();
    let received: SignedCommand = serde_json::from_str(&wire).unwrap();
    assert!(platform.verifier.verify(&received).is_execute());

    let replayed: SignedCommand = serde_json::from_str(&wire).unwrap();
    assert!(matches!(
        platform.verifier.verify(&replayed).error(),
        Some(VerifyError::ReplayDetected { .. })
    ));
}

/// Command carrying genuine officer shares whose envelope is signed by an
/// issuer key the platform was never provisioned with
fn forge_with_foreign_issuer(authority: &Authority) -> SignedCommand {
    let issued_at_ns = authority.clock.now_ns();
    let ttl_secs = 120;
    let issuer = killswitch_crypto::SoftwareCustody::generate();
    let mut group = authority.group_key();
    group.issuer_key = issuer.public_key();

    let proposal = authority.open(
        ActionType::Engage,
        TargetSet::new().platform("uav-1").designator("T1"),
        3,
    );
    let shares: Vec<_> = ['a', 'b', 'c']
        .into_iter()
        .map(|l| {
            let approval = authority.approval(&proposal, l);
            SignatureShare {
                signer_id: approval.officer_id,
                signature: approval.signature,
            }
        })
        .collect();
    let nonce = NonceGenerator::new().next_nonce();
    let digest = proposal.digest();
    let fingerprint = group.fingerprint();
    let combined = CombinedSignature::combine(&group, shares, &issuer, |ids| {
        envelope_message(&digest, issued_at_ns, &nonce, ttl_secs, KEY_EPOCH, &fingerprint, ids)
    })
    .unwrap();
    SignedCommand {
        proposal_id: proposal.proposal_id(),
        cmd: proposal.action(),
        targets: proposal.targets().clone(),
        proposer_id: proposal.proposer_id().to_string(),
        proposed_at_ns: proposal.created_at_ns(),
        context_digest: proposal.context_digest(),
        issued_at_ns,
        nonce,
        ttl_secs,
        key_epoch: KEY_EPOCH,
        combined_signature: combined,
    }
}

#[test]
fn test_ten_minute_old_command_expires() {
    let authority = Authority::new(5, 3);
    let command = issue_engage(&authority, "uav-1", 3);
    assert_eq!(command.ttl_secs, 120);

    // Delivered ten minutes after issue
    authority.clock.advance(Duration::from_secs(600));
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());

    let report = platform.verifier.verify(&command);
    assert_eq!(report.state, CommandState::HoldFire);
    assert!(matches!(report.error(), Some(VerifyError::Expired { ttl_secs: 120, .. })));
    assert_eq!(report.mode_after, FailsafeMode::HoldFire);
    assert_eq!(platform.failsafe.suspicion_count().unwrap(), 1);

    let suspicions: Vec<_> = platform
        .audit
        .entries()
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.event {
            AuditEvent::SuspicionRaised { suspicion, .. } => Some(suspicion),
            _ => None,
        })
        .collect();
    assert_eq!(suspicions, vec![SuspicionKind::Expired.to_string()]);
}

#[test]
fn test_foreign_issuer_key_is_invalid_signature() {
    let authority = Authority::new(5, 3);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());

    // Valid officer shares, envelope signed by a key the platform does not trust
    let forged = forge_with_foreign_issuer(&authority);
    assert!(matches!(
        platform.verifier.verify(&forged).error(),
        Some(VerifyError::InvalidSignature(_))
    ));
}

#[test]
fn test_three_invalid_signatures_lock_platform() {
    let authority = Authority::new(5, 3);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());
    let modes = platform.failsafe.subscribe().unwrap();

    // Three forgeries in a row inside the window, no operator action between them
    for _ in 0..3 {
        let mut command = issue_engage(&authority, "uav-1", 3);
        command.ttl_secs = 60;
        authority.clock.advance(Duration::from_secs(10));
        let report = platform.verifier.verify(&command);
        assert!(matches!(report.error(), Some(VerifyError::InvalidSignature(_))));
    }
    assert_eq!(platform.failsafe.mode().unwrap(), FailsafeMode::Locked);

    // Valid commands are rejected unconditionally while locked
    let valid = issue_engage(&authority, "uav-1", 3);
    let report = platform.verifier.verify(&valid);
    assert!(matches!(
        report.error(),
        Some(VerifyError::FailsafeEngaged {
            mode: FailsafeMode::Locked
        })
    ));
    assert!(matches!(
        platform.failsafe.resume(&platform.resume_token("watch-officer")),
        Err(FailsafeError::WrongMode { .. })
    ));

    let token = ResetToken::sign(
        "uav-1",
        platform.failsafe.lock_seq().unwrap(),
        &platform.reset_authority,
    )
    .unwrap();
    platform.failsafe.reset_locked(&token).unwrap();
    assert!(platform.verifier.verify(&valid).is_execute());

    let transitions: Vec<_> = modes.try_iter().map(|c| c.to).collect();
    assert_eq!(transitions.last(), Some(&FailsafeMode::Normal));
    assert!(transitions.contains(&FailsafeMode::Locked));
}

#[test]
fn test_fleet_shutdown_reaches_fleet_members_only() {
    let authority = Authority::new(5, 3);
    let north = Platform::new("uav-1", Some("north"), authority.group_key(), authority.clock.clone());
    let south = Platform::new("uav-2", Some("south"), authority.group_key(), authority.clock.clone());

    let proposal = authority.open(ActionType::ShutdownFleet, TargetSet::new().fleet("north"), 3);
    for letter in ['a', 'b', 'c'] {
        authority.approve(&proposal, letter).unwrap();
    }
    let command = authority.issuer.issue(proposal.proposal_id()).unwrap();

    assert!(north.verifier.verify(&command).is_execute());
    let report = south.verifier.verify(&command);
    assert!(matches!(report.error(), Some(VerifyError::NotApplicable(_))));
    assert_eq!(south.failsafe.mode().unwrap(), FailsafeMode::Normal);

    // The same nonce is independent per platform, and replays are still caught
    assert!(matches!(
        north.verifier.verify(&command).error(),
        Some(VerifyError::ReplayDetected { .. })
    ));
}

#[test]
fn test_proposal_deadline_expires_collection() {
    let authority = Authority::new(5, 3);
    let proposal = authority.open(
        ActionType::ShutdownUnit,
        TargetSet::new().platform("ugv-1"),
        3,
    );
    authority.approve(&proposal, 'a').unwrap();
    authority.approve(&proposal, 'b').unwrap();

    authority.clock.advance(Duration::from_secs(121));
    assert!(matches!(
        authority.approve(&proposal, 'c'),
        Err(CollectorError::ProposalExpired { .. })
    ));
    assert!(matches!(
        authority.issuer.issue(proposal.proposal_id()),
        Err(IssueError::ProposalExpired { .. } | IssueError::ProposalClosed { .. })
    ));
}

#[test]
fn test_abort_closes_proposal() {
    let authority = Authority::new(5, 3);
    let proposal = authority.open(
        ActionType::ShutdownUnit,
        TargetSet::new().platform("ugv-1"),
        3,
    );
    authority.approve(&proposal, 'a').unwrap();
    authority
        .collector
        .abort(proposal.proposal_id(), "target left area")
        .unwrap();

    assert!(matches!(
        authority.approve(&proposal, 'b'),
        Err(CollectorError::ProposalClosed { .. })
    ));
    // Evidence from before the abort is kept
    let status = authority.collector.status(proposal.proposal_id()).unwrap();
    assert_eq!(status.count(), 1);
}

#[test]
fn test_issued_at_in_the_future_is_expired() {
    let authority = Authority::new(5, 3);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());
    let command = issue_engage(&authority, "uav-1", 3);

    // Platform clock runs 30 s behind the authority
    platform.clock.set(command.issued_at_ns - secs_to_ns(30));
    assert!(matches!(
        platform.verifier.verify(&command).error(),
        Some(VerifyError::Expired { .. })
    ));
}
