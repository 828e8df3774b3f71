//! Concurrency properties: per-proposal atomicity, at-most-one issuance,
//! and atomic nonce insertion under racing deliveries.

use std::sync::Arc;

use killswitch_c2_router::{CollectorError, IssueError};
use killswitch_domain::{ActionType, TargetSet};
use killswitch_edge::{CommandState, VerifyError};

use crate::test_utils::*;

#[test]
fn test_same_officer_racing_submissions_accept_once() {
    let authority = Authority::new(5, 3);
    let proposal = authority.open(
        ActionType::ShutdownUnit,
        TargetSet::new().platform("ugv-1"),
        3,
    );
    // Distinct submission timestamps; the first one recorded still wins
    let approvals: Vec<_> = (0..16)
        .map(|_| {
            authority.clock.advance(std::time::Duration::from_millis(1));
            authority.approval(&proposal, 'a')
        })
        .collect();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = approvals
            .into_iter()
            .map(|approval| {
                let collector = &authority.collector;
                let id = proposal.proposal_id();
                s.spawn(move || collector.submit(id, approval))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CollectorError::DuplicateApproval { .. })));
    assert_eq!(
        authority.collector.status(proposal.proposal_id()).unwrap().count(),
        1
    );
}

#[test]
fn test_quorum_newly_satisfied_exactly_once() {
    let authority = Authority::new(9, 3);
    let proposal = authority.open(
        ActionType::ShutdownUnit,
        TargetSet::new().platform("ugv-1"),
        3,
    );
    let approvals: Vec<_> = ('a'..='i')
        .map(|letter| authority.approval(&proposal, letter))
        .collect();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = approvals
            .into_iter()
            .map(|approval| {
                let collector = &authority.collector;
                let id = proposal.proposal_id();
                s.spawn(move || collector.submit(id, approval))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let accepted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(accepted.len(), 3);
    assert_eq!(accepted.iter().filter(|s| s.newly_satisfied).count(), 1);
    // Late approvals find the proposal closed, never double-counted
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CollectorError::ProposalClosed { .. })));
}

#[test]
fn test_racing_issue_calls_issue_once() {
    let authority = Authority::new(5, 3);
    let proposal = authority.open(
        ActionType::Engage,
        TargetSet::new().platform("uav-1").designator("T1"),
        3,
    );
    for letter in ['a', 'b', 'c'] {
        authority.approve(&proposal, letter).unwrap();
    }

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let issuer = &authority.issuer;
                let id = proposal.proposal_id();
                s.spawn(move || issuer.issue(id))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, IssueError::AlreadyIssued { .. })));
}

#[test]
fn test_racing_deliveries_execute_once() {
    let authority = Authority::new(5, 3);
    let platform = Platform::new("uav-1", None, authority.group_key(), authority.clock.clone());
    let command = issue_engage(&authority, "uav-1", 3);

    let reports: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let verifier = &platform.verifier;
                let command = &command;
                s.spawn(move || verifier.verify(command))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let executed = reports
        .iter()
        .filter(|r| r.state == CommandState::Execute)
        .count();
    assert_eq!(executed, 1);
    // Losers either hit the ledger or found the platform already holding fire
    assert!(reports.iter().filter_map(|r| r.error()).all(|e| matches!(
        e,
        VerifyError::ReplayDetected { .. } | VerifyError::FailsafeEngaged { .. }
    )));
    assert!(platform.ledger.contains("uav-1", &command.nonce).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_proposals_progress_independently() {
    let authority = Arc::new(Authority::new(5, 3));
    let proposals: Vec<_> = (0..6)
        .map(|i| {
            authority.open(
                ActionType::ShutdownUnit,
                TargetSet::new().platform(format!("ugv-{i}")),
                3,
            )
        })
        .collect();

    let mut tasks = Vec::new();
    for proposal in &proposals {
        for letter in ['a', 'b', 'c', 'd'] {
            let authority = Arc::clone(&authority);
            let proposal = proposal.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                authority.approve(&proposal, letter)
            }));
        }
    }

    let mut newly_satisfied = 0;
    for task in tasks {
        if let Ok(status) = task.await.unwrap() {
            if status.newly_satisfied {
                newly_satisfied += 1;
            }
        }
    }
    assert_eq!(newly_satisfied, proposals.len());

    let mut issues = Vec::new();
    for proposal in &proposals {
        let authority = Arc::clone(&authority);
        let id = proposal.proposal_id();
        issues.push(tokio::task::spawn_blocking(move || authority.issuer.issue(id)));
    }
    let mut nonces = std::collections::HashSet::new();
    for issue in issues {
        let command = issue.await.unwrap().unwrap();
        assert!(nonces.insert(command.nonce));
    }
    assert_eq!(nonces.len(), proposals.len());
    authority.audit.verify().unwrap();
}
