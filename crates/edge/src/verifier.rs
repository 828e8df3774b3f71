//! Command verifier - runs on each receiving platform.
//!
//! Each delivered [`SignedCommand`] is a [`CommandInstance`] driven through
//! `AWAITING -> VERIFYING -> EXECUTE | HOLD_FIRE`. From `VERIFYING` the
//! checks run in a fixed order and the first failure wins:
//!
//! 1. failsafe admits commands (platform is NORMAL)
//! 2. arrival rate is under the flood limit
//! 3. combined signature verifies under the provisioned group key and epoch
//! 4. `issued_at - skew <= now <= issued_at + min(ttl, max_ttl)`
//! 5. `(platform_id, nonce)` not already in the nonce ledger
//! 6. targets address this platform and the action is accepted here
//!
//! Checks 5 and 6 are evaluated together: applicability is computed first
//! without side effects, then an applicable command's nonce is recorded with
//! one atomic insert-if-absent. An inapplicable command never consumes a
//! nonce, but a replayed one is still reported as a replay.
//!
//! While the platform is in HOLD_FIRE or LOCKED every command is rejected,
//! but signature, window and replay are still screened read-only. A forged,
//! stale or replayed command is reported as such and counts toward LOCKED;
//! anything else is `FailsafeEngaged` and its nonce stays unused.
//!
//! Every verification is audited. An EXECUTE whose audit record cannot be
//! written is downgraded to HOLD_FIRE.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use killswitch_core::config::{NodeConfig, VerifierConfig};
use killswitch_core::time::secs_to_ns;
use killswitch_core::{AuditEvent, AuditLog, Clock};
use killswitch_crypto::{GroupVerificationKey, Nonce};
use killswitch_domain::{ActionType, ProposalId, SignedCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{FailsafeError, NonceLedgerError, PolicyError, VerifyError};
use crate::failsafe::{FailsafeController, FailsafeMode};
use crate::nonce_ledger::{InsertOutcome, NonceLedger};
use crate::rate_limit::{RateDecision, RateLimiter};

/// Audit source for verification records
pub const VERIFIER_SOURCE: &str = "command-verifier";

/// What this platform is and what it will execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPolicy {
    pub platform_id: String,
    pub fleet_id: Option<String>,
    pub accepted_actions: BTreeSet<ActionType>,
    pub max_command_ttl_secs: u64,
    pub max_clock_skew_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_commands: usize,
}

impl PlatformPolicy {
    pub fn from_config(
        node: &NodeConfig,
        verifier: &VerifierConfig,
    ) -> Result<Self, PolicyError> {
        if node.platform_id.trim().is_empty() {
            return Err(PolicyError::Invalid("platform_id is empty".to_string()));
        }
        let accepted_actions = verifier
            .accepted_actions
            .iter()
            .map(|a| {
                a.parse::<ActionType>()
                    .map_err(|e| PolicyError::Invalid(e.to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            platform_id: node.platform_id.clone(),
            fleet_id: node.fleet_id.clone(),
            accepted_actions,
            max_command_ttl_secs: verifier.max_command_ttl_secs,
            max_clock_skew_secs: verifier.max_clock_skew_secs,
            rate_limit_window_secs: verifier.rate_limit_window_secs,
            rate_limit_max_commands: verifier.rate_limit_max_commands,
        })
    }

    /// How long a nonce must be remembered: the longest a command can be
    /// valid on this platform, including forward clock skew
    pub fn nonce_retention(&self) -> Duration {
        Duration::from_secs(
            self.max_command_ttl_secs
                .saturating_add(self.max_clock_skew_secs),
        )
    }
}

/// Per-command verification state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    Awaiting,
    Verifying,
    Execute,
    HoldFire,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Awaiting => "AWAITING",
            CommandState::Verifying => "VERIFYING",
            CommandState::Execute => "EXECUTE",
            CommandState::HoldFire => "HOLD_FIRE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Execute | CommandState::HoldFire)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery of one command
#[derive(Debug, Clone)]
pub struct CommandInstance {
    proposal_id: ProposalId,
    nonce: Nonce,
    state: CommandState,
}

impl CommandInstance {
    pub fn new(command: &SignedCommand) -> Self {
        Self {
            proposal_id: command.proposal_id,
            nonce: command.nonce,
            state: CommandState::Awaiting,
        }
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Move to `to` if the transition is legal. Terminal states never change.
    pub fn advance(&mut self, to: CommandState) -> bool {
        let legal = matches!(
            (self.state, to),
            (CommandState::Awaiting, CommandState::Verifying)
                | (CommandState::Verifying, CommandState::Execute)
                | (CommandState::Verifying, CommandState::HoldFire)
        );
        if legal {
            debug!(
                proposal_id = %self.proposal_id,
                nonce = %self.nonce,
                from = %self.state,
                to = %to,
                "Command state transition"
            );
            self.state = to;
        }
        legal
    }
}

/// A command that passed every check, handed to the actuation boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedCommand {
    pub platform_id: String,
    pub verified_at_ns: u64,
    pub command: SignedCommand,
}

/// Result of one verification
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub platform_id: String,
    pub proposal_id: ProposalId,
    pub nonce: Nonce,
    pub state: CommandState,
    pub outcome: Result<ValidatedCommand, VerifyError>,
    pub mode_after: FailsafeMode,
}

impl VerificationReport {
    pub fn is_execute(&self) -> bool {
        self.state == CommandState::Execute
    }

    pub fn error(&self) -> Option<&VerifyError> {
        self.outcome.as_ref().err()
    }
}

/// Verifies delivered commands for one platform.
pub struct CommandVerifier {
    policy: PlatformPolicy,
    group: GroupVerificationKey,
    ledger: Arc<NonceLedger>,
    failsafe: Arc<FailsafeController>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    limiter: Mutex<RateLimiter>,
}

impl fmt::Debug for CommandVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandVerifier")
            .field("platform_id", &self.policy.platform_id)
            .field("key_epoch", &self.group.key_epoch)
            .finish_non_exhaustive()
    }
}

impl CommandVerifier {
    pub fn new(
        policy: PlatformPolicy,
        group: GroupVerificationKey,
        ledger: Arc<NonceLedger>,
        failsafe: Arc<FailsafeController>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PolicyError> {
        if failsafe.platform_id() != policy.platform_id {
            return Err(PolicyError::Invalid(format!(
                "failsafe belongs to {}, verifier to {}",
                failsafe.platform_id(),
                policy.platform_id
            )));
        }
        if policy.rate_limit_window_secs == 0 || policy.rate_limit_max_commands == 0 {
            return Err(PolicyError::Invalid(
                "rate limit window and maximum must be non-zero".to_string(),
            ));
        }
        let retention_ns = secs_to_ns(policy.nonce_retention().as_secs());
        if ledger.retention_ns() < retention_ns {
            return Err(PolicyError::Invalid(format!(
                "nonce ledger retention {}ns is shorter than the command validity window {}ns",
                ledger.retention_ns(),
                retention_ns
            )));
        }

        info!(
            platform_id = %policy.platform_id,
            key_epoch = group.key_epoch,
            group = %group.fingerprint_hex(),
            "Command verifier ready"
        );

        let limiter = RateLimiter::new(
            policy.rate_limit_window_secs,
            policy.rate_limit_max_commands,
        );
        Ok(Self {
            policy,
            group,
            ledger,
            failsafe,
            audit,
            clock,
            limiter: Mutex::new(limiter),
        })
    }

    pub fn policy(&self) -> &PlatformPolicy {
        &self.policy
    }

    pub fn group_key(&self) -> &GroupVerificationKey {
        &self.group
    }

    pub fn failsafe(&self) -> &Arc<FailsafeController> {
        &self.failsafe
    }

    /// Verify one delivered command.
    ///
    /// Never fails: every error resolves to a HOLD_FIRE report.
    pub fn verify(&self, command: &SignedCommand) -> VerificationReport {
        let mut instance = CommandInstance::new(command);
        instance.advance(CommandState::Verifying);

        let now = self.clock.now_ns();
        let mut outcome = self.run_checks(command, now);

        if let Err(err) = &outcome {
            self.escalate(err);
        }

        let audit_result = self.audit.append(
            VERIFIER_SOURCE,
            AuditEvent::CommandVerified {
                platform_id: self.policy.platform_id.clone(),
                proposal_id: command.proposal_id.to_string(),
                nonce: command.nonce.to_hex(),
                outcome: match &outcome {
                    Ok(_) => CommandState::Execute.to_string(),
                    Err(_) => CommandState::HoldFire.to_string(),
                },
                reason: outcome
                    .as_ref()
                    .err()
                    .map(|e| format!("{}: {e}", e.label())),
            },
        );

        if let Err(e) = audit_result {
            error!(
                platform_id = %self.policy.platform_id,
                proposal_id = %command.proposal_id,
                error = %e,
                "Verification audit failed; holding fire"
            );
            if outcome.is_ok() {
                let err = VerifyError::AuditUnavailable(e.to_string());
                self.escalate(&err);
                outcome = Err(err);
            }
        }

        match &outcome {
            Ok(_) => {
                instance.advance(CommandState::Execute);
                info!(
                    platform_id = %self.policy.platform_id,
                    proposal_id = %command.proposal_id,
                    action = %command.cmd,
                    nonce = %command.nonce,
                    "Command verified: EXECUTE"
                );
            }
            Err(e) => {
                instance.advance(CommandState::HoldFire);
                warn!(
                    platform_id = %self.policy.platform_id,
                    proposal_id = %command.proposal_id,
                    nonce = %command.nonce,
                    reason = e.label(),
                    error = %e,
                    "Command rejected: HOLD_FIRE"
                );
            }
        }

        VerificationReport {
            platform_id: self.policy.platform_id.clone(),
            proposal_id: command.proposal_id,
            nonce: command.nonce,
            state: instance.state(),
            outcome,
            mode_after: self.failsafe.mode().unwrap_or(FailsafeMode::Locked),
        }
    }

    fn run_checks(&self, command: &SignedCommand, now: u64) -> Result<ValidatedCommand, VerifyError> {
        match self.failsafe.admit() {
            Ok(()) => {}
            Err(FailsafeError::Engaged { mode }) => {
                self.screen_while_engaged(command, now)?;
                return Err(VerifyError::FailsafeEngaged { mode });
            }
            Err(e) => return Err(VerifyError::FailsafeUnavailable(e.to_string())),
        }

        let decision = self
            .limiter
            .lock()
            .map_err(|_| VerifyError::FailsafeUnavailable("rate limiter lock poisoned".to_string()))?
            .record(now);
        if let RateDecision::Limited { count } = decision {
            return Err(VerifyError::RateLimited {
                count,
                window_secs: self.policy.rate_limit_window_secs,
            });
        }

        command
            .verify_signature(&self.group)
            .map_err(|e| VerifyError::InvalidSignature(e.to_string()))?;

        self.check_window(command, now)?;

        let applicability = self.applicability(command);
        match applicability {
            Ok(()) => match self
                .ledger
                .check_and_insert(&self.policy.platform_id, &command.nonce, now)
            {
                Ok(InsertOutcome::Inserted) => {}
                Ok(InsertOutcome::AlreadyPresent) => {
                    return Err(VerifyError::ReplayDetected {
                        nonce: command.nonce.to_hex(),
                    })
                }
                Err(e) => return Err(ledger_error(e)),
            },
            Err(reason) => {
                let seen = self
                    .ledger
                    .contains(&self.policy.platform_id, &command.nonce)
                    .map_err(ledger_error)?;
                if seen {
                    return Err(VerifyError::ReplayDetected {
                        nonce: command.nonce.to_hex(),
                    });
                }
                return Err(VerifyError::NotApplicable(reason));
            }
        }

        Ok(ValidatedCommand {
            platform_id: self.policy.platform_id.clone(),
            verified_at_ns: now,
            command: command.clone(),
        })
    }

    /// Attack checks without side effects, for commands that will be
    /// rejected anyway
    fn screen_while_engaged(&self, command: &SignedCommand, now: u64) -> Result<(), VerifyError> {
        command
            .verify_signature(&self.group)
            .map_err(|e| VerifyError::InvalidSignature(e.to_string()))?;
        self.check_window(command, now)?;
        if self
            .ledger
            .contains(&self.policy.platform_id, &command.nonce)
            .map_err(ledger_error)?
        {
            return Err(VerifyError::ReplayDetected {
                nonce: command.nonce.to_hex(),
            });
        }
        Ok(())
    }

    fn check_window(&self, command: &SignedCommand, now: u64) -> Result<(), VerifyError> {
        let ttl_secs = command.ttl_secs.min(self.policy.max_command_ttl_secs);
        let not_before = command
            .issued_at_ns
            .saturating_sub(secs_to_ns(self.policy.max_clock_skew_secs));
        let not_after = command.issued_at_ns.saturating_add(secs_to_ns(ttl_secs));

        if now < not_before || now > not_after {
            return Err(VerifyError::Expired {
                issued_at_ns: command.issued_at_ns,
                ttl_secs: command.ttl_secs,
                now_ns: now,
            });
        }
        Ok(())
    }

    fn applicability(&self, command: &SignedCommand) -> Result<(), String> {
        if !command
            .targets
            .applies_to(&self.policy.platform_id, self.policy.fleet_id.as_deref())
        {
            return Err(format!(
                "targets do not address {}",
                self.policy.platform_id
            ));
        }
        if !self.policy.accepted_actions.contains(&command.cmd) {
            return Err(format!("{} is not accepted by this platform", command.cmd));
        }
        Ok(())
    }

    /// Hand a failure to the failsafe controller
    fn escalate(&self, err: &VerifyError) {
        let result = match err {
            VerifyError::NotApplicable(_) | VerifyError::FailsafeEngaged { .. } => return,
            VerifyError::CapacityExhausted { .. }
            | VerifyError::LedgerUnavailable(_)
            | VerifyError::FailsafeUnavailable(_)
            | VerifyError::AuditUnavailable(_) => self.failsafe.hold_fire(err.label()),
            _ => match err.suspicion() {
                Some(kind) => self.failsafe.report_suspicion(kind),
                None => return,
            },
        };
        if let Err(e) = result {
            error!(
                platform_id = %self.policy.platform_id,
                error = %e,
                "Failsafe escalation incomplete"
            );
        }
    }
}

fn ledger_error(err: NonceLedgerError) -> VerifyError {
    match err {
        NonceLedgerError::CapacityExhausted {
            platform_id,
            capacity,
        } => VerifyError::CapacityExhausted {
            platform_id,
            capacity,
        },
        other => VerifyError::LedgerUnavailable(other.to_string()),
    }
}
