//! Black-box audit across a full approval, issue and verify cycle.

use std::time::Duration;

use killswitch_core::{verify_against_checkpoint, verify_chain, AuditError, AuditEvent, AuditLog};
use killswitch_domain::{ActionType, TargetSet};
use killswitch_edge::VerifyError;

use crate::test_utils::*;

#[test]
fn test_authority_log_records_full_lifecycle() {
    let authority = Authority::new(5, 3);
    let proposal = authority.open(
        ActionType::ShutdownUnit,
        TargetSet::new().platform("ugv-1"),
        3,
    );
    authority.approve(&proposal, 'a').unwrap();
    assert!(authority.approve(&proposal, 'a').is_err());
    authority.approve(&proposal, 'b').unwrap();
    authority.approve(&proposal, 'c').unwrap();
    let command = authority.issuer.issue(proposal.proposal_id()).unwrap();

    let kinds: Vec<_> = authority
        .audit
        .entries()
        .unwrap()
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "proposal_opened",
            "approval_accepted",
            "approval_rejected",
            "approval_accepted",
            "approval_accepted",
            "quorum_satisfied",
            "command_issued",
        ]
    );

    let issued = authority
        .audit
        .entries()
        .unwrap()
        .into_iter()
        .find_map(|e| match e.event {
            AuditEvent::CommandIssued { nonce, signers, .. } => Some((nonce, signers)),
            _ => None,
        })
        .unwrap();
    assert_eq!(issued.0, command.nonce.to_hex());
    assert_eq!(issued.1, vec!["officer-a", "officer-b", "officer-c"]);
    authority.audit.verify().unwrap();
}

#[test]
fn test_edited_issue_record_is_detected() {
    let authority = Authority::new(5, 3);
    issue_engage(&authority, "uav-1", 3);
    let checkpoint = authority.audit.checkpoint().unwrap();

    let mut entries = authority.audit.entries().unwrap();
    let position = entries
        .iter()
        .position(|e| matches!(e.event, AuditEvent::CommandIssued { .. }))
        .unwrap();
    if let AuditEvent::CommandIssued { signers, .. } = &mut entries[position].event {
        signers.pop();
    }

    assert!(matches!(
        verify_chain(&entries),
        Err(AuditError::ChainBroken { .. })
    ));

    // Rewriting every hash from the edit forward still misses the checkpoint
    let mut prev = entries[position].prev_hash;
    for entry in entries.iter_mut().skip(position) {
        entry.prev_hash = prev;
        entry.entry_hash = entry.recompute_hash().unwrap();
        prev = entry.entry_hash;
    }
    verify_chain(&entries).unwrap();
    assert!(matches!(
        verify_against_checkpoint(&entries, &checkpoint),
        Err(AuditError::CheckpointMismatch { .. })
    ));
}

#[test]
fn test_platform_log_streams_verification_outcomes() {
    let authority = Authority::new(5, 3);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());
    let stream = platform.audit.subscribe().unwrap();

    let command = issue_engage(&authority, "uav-1", 3);
    assert!(platform.verifier.verify(&command).is_execute());
    authority.clock.advance(Duration::from_secs(1));
    assert!(matches!(
        platform.verifier.verify(&command).error(),
        Some(VerifyError::ReplayDetected { .. })
    ));

    let streamed: Vec<_> = stream.try_iter().collect();
    let outcomes: Vec<_> = streamed
        .iter()
        .filter_map(|e| match &e.event {
            AuditEvent::CommandVerified {
                outcome, reason, ..
            } => Some((
                outcome.as_str(),
                reason.as_deref().and_then(|r| r.split(':').next()),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("EXECUTE", None),
            ("HOLD_FIRE", Some("REPLAY_DETECTED")),
        ]
    );
    assert!(streamed
        .iter()
        .any(|e| matches!(e.event, AuditEvent::SuspicionRaised { .. })));
    assert!(streamed
        .iter()
        .any(|e| matches!(&e.event, AuditEvent::ModeChanged { to, .. } if to == "HOLD_FIRE")));

    // The stream mirrors the stored chain entry for entry
    assert_eq!(streamed, platform.audit.entries().unwrap());
}

#[test]
fn test_durable_platform_log_survives_restart() {
    let path = std::env::temp_dir().join(format!("killswitch-audit-{}.db", uuid::Uuid::new_v4()));
    let authority = Authority::new(3, 2);
    let command = issue_engage(&authority, "uav-1", 2);

    let head = {
        let audit = AuditLog::open(&path, "uav-1", authority.clock.clone()).unwrap();
        audit
            .append(
                "command-verifier",
                AuditEvent::CommandVerified {
                    platform_id: "uav-1".to_string(),
                    proposal_id: command.proposal_id.to_string(),
                    nonce: command.nonce.to_hex(),
                    outcome: "EXECUTE".to_string(),
                    reason: None,
                },
            )
            .unwrap();
        audit.checkpoint().unwrap()
    };

    let reopened = AuditLog::open(&path, "uav-1", authority.clock.clone()).unwrap();
    assert_eq!(reopened.checkpoint().unwrap(), head);
    verify_against_checkpoint(&reopened.entries().unwrap(), &head).unwrap();

    drop(reopened);
    let _ = std::fs::remove_file(&path);
}
