//! Platform runtime: wires the verifier, nonce ledger, failsafe and audit log
//! from configuration and handles one line-delimited JSON message at a time.

use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use killswitch_core::time::secs_to_ns;
use killswitch_core::{AuditLog, Clock, Config};
use killswitch_crypto::GroupVerificationKey;
use killswitch_domain::SignedCommand;
use killswitch_edge::{
    CommandState, CommandVerifier, FailsafeController, FailsafeMode, FailsafePolicy, ModeChange,
    NonceLedger, PlatformPolicy, ResetToken, ResumeToken,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const AUDIT_DB: &str = "audit.db";
const NONCE_DB: &str = "nonces.db";
const PRUNE_INTERVAL_SECS: u64 = 60;

/// Operator and root-of-trust messages sharing the command channel.
/// Anything that lifts a hold or a lock carries a signed token.
#[derive(Debug, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
enum ControlMessage {
    Resume { token: ResumeToken },
    Reset { token: ResetToken },
    HoldFire { reason: String },
    Status,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Control(ControlMessage),
    Command(Box<SignedCommand>),
}

/// One output line
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Verification {
        platform_id: String,
        proposal_id: String,
        nonce: String,
        state: CommandState,
        reason: Option<&'static str>,
        detail: Option<String>,
        mode: FailsafeMode,
    },
    Control {
        control: &'static str,
        ok: bool,
        error: Option<String>,
        mode: Option<FailsafeMode>,
        lock_seq: Option<u64>,
    },
    Malformed {
        error: String,
    },
}

pub struct Node {
    verifier: CommandVerifier,
    failsafe: Arc<FailsafeController>,
    ledger: Arc<NonceLedger>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    last_prune_ns: Mutex<u64>,
}

impl Node {
    /// Open durable state under `node.data_dir` and load the provisioned group key
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let data_dir = &config.node.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let group = load_group_key(&config.node.group_key_path)?;
        let policy = PlatformPolicy::from_config(&config.node, &config.verifier)?;

        let audit = Arc::new(
            AuditLog::open(
                data_dir.join(AUDIT_DB),
                config.node.platform_id.clone(),
                clock.clone(),
            )
            .context("opening audit log")?,
        );
        let ledger = Arc::new(
            NonceLedger::open(
                data_dir.join(NONCE_DB),
                policy.nonce_retention(),
                config.verifier.max_nonces_per_platform,
            )
            .context("opening nonce ledger")?,
        );

        Self::assemble(config, policy, group, ledger, audit, clock)
    }

    /// Volatile node for tests and dry runs
    pub fn in_memory(
        config: &Config,
        group: GroupVerificationKey,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let policy = PlatformPolicy::from_config(&config.node, &config.verifier)?;
        let audit = Arc::new(AuditLog::in_memory(
            config.node.platform_id.clone(),
            clock.clone(),
        ));
        let ledger = Arc::new(NonceLedger::in_memory(
            policy.nonce_retention(),
            config.verifier.max_nonces_per_platform,
        ));
        Self::assemble(config, policy, group, ledger, audit, clock)
    }

    fn assemble(
        config: &Config,
        policy: PlatformPolicy,
        group: GroupVerificationKey,
        ledger: Arc<NonceLedger>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let failsafe = Arc::new(FailsafeController::new(
            policy.platform_id.clone(),
            FailsafePolicy::from_config(&config.failsafe)?,
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
        )?;
        let now = clock.now_ns();
        Ok(Self {
            verifier,
            failsafe,
            ledger,
            audit,
            clock,
            last_prune_ns: Mutex::new(now),
        })
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn subscribe_mode_changes(&self) -> anyhow::Result<Receiver<ModeChange>> {
        Ok(self.failsafe.subscribe()?)
    }

    /// Handle one input line
    pub fn handle_line(&self, line: &str) -> Decision {
        match serde_json::from_str::<Inbound>(line) {
            Ok(Inbound::Command(command)) => self.handle_command(&command),
            Ok(Inbound::Control(control)) => self.handle_control(control),
            Err(e) => {
                warn!(error = %e, "Malformed input line");
                Decision::Malformed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn handle_command(&self, command: &SignedCommand) -> Decision {
        self.maybe_prune();
        let report = self.verifier.verify(command);
        let error = report.error();
        Decision::Verification {
            platform_id: report.platform_id.clone(),
            proposal_id: report.proposal_id.to_string(),
            nonce: report.nonce.to_hex(),
            state: report.state,
            reason: error.map(|e| e.label()),
            detail: error.map(|e| e.to_string()),
            mode: report.mode_after,
        }
    }

    fn handle_control(&self, control: ControlMessage) -> Decision {
        let (name, result) = match control {
            ControlMessage::Resume { token } => ("resume", self.failsafe.resume(&token)),
            ControlMessage::Reset { token } => ("reset", self.failsafe.reset_locked(&token)),
            ControlMessage::HoldFire { reason } => {
                ("hold_fire", self.failsafe.hold_fire(&reason).map(|_| ()))
            }
            ControlMessage::Status => ("status", Ok(())),
        };
        if let Err(e) = &result {
            warn!(control = name, error = %e, "Control message rejected");
        } else {
            info!(control = name, "Control message applied");
        }
        Decision::Control {
            control: name,
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            mode: self.failsafe.mode().ok(),
            lock_seq: self.failsafe.lock_seq().ok(),
        }
    }

    fn maybe_prune(&self) {
        let now = self.clock.now_ns();
        let Ok(mut last) = self.last_prune_ns.lock() else {
            return;
        };
        if now.saturating_sub(*last) < secs_to_ns(PRUNE_INTERVAL_SECS) {
            return;
        }
        *last = now;
        match self.ledger.prune(now) {
            Ok(removed) => debug!(removed, "Nonce ledger pruned"),
            Err(e) => warn!(error = %e, "Nonce ledger prune failed"),
        }
    }
}

fn load_group_key(path: &Path) -> anyhow::Result<GroupVerificationKey> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading group key {}", path.display()))?;
    let group: GroupVerificationKey =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    info!(
        key_epoch = group.key_epoch,
        threshold = group.threshold,
        members = group.members.len(),
        fingerprint = %group.fingerprint_hex(),
        "Group verification key loaded"
    );
    Ok(group)
}
