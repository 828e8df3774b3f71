//! Failsafe controller - platform-wide fail-closed mode.
//!
//! Modes:
//! - `NORMAL`: commands are admitted to verification
//! - `HOLD_FIRE`: entered on any suspicion or explicit abort; only a resume
//!   token signed by the resume (or reset) authority leaves it
//! - `LOCKED`: entered when suspicions within the sliding window reach the
//!   threshold; only a root-of-trust reset token leaves it
//!
//! Both non-normal modes reject every incoming command unconditionally.
//! Suspicions keep counting while engaged, so an attack that continues
//! after the first HOLD_FIRE still escalates to LOCKED.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use killswitch_core::config::FailsafeConfig;
use killswitch_core::time::duration_to_ns;
use killswitch_core::{AuditEvent, AuditLog, Clock};
use killswitch_crypto::{
    domains, key_id_for, validate_public_key, verify_signature, CanonicalEncoder, CryptoError,
    KeyCustody, PublicKeyBytes,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{FailsafeError, PolicyError};

/// Audit source for failsafe events
pub const FAILSAFE_SOURCE: &str = "failsafe";

const RESET_AUTHORITY_SIGNER: &str = "reset-authority";
const RESUME_AUTHORITY_SIGNER: &str = "resume-authority";

type Result<T> = std::result::Result<T, FailsafeError>;

/// Platform-wide mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailsafeMode {
    Normal,
    HoldFire,
    Locked,
}

impl FailsafeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailsafeMode::Normal => "NORMAL",
            FailsafeMode::HoldFire => "HOLD_FIRE",
            FailsafeMode::Locked => "LOCKED",
        }
    }
}

impl fmt::Display for FailsafeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification failures treated as a possible attack signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuspicionKind {
    InvalidSignature,
    ReplayDetected,
    Expired,
    RateLimited,
}

impl SuspicionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionKind::InvalidSignature => "INVALID_SIGNATURE",
            SuspicionKind::ReplayDetected => "REPLAY_DETECTED",
            SuspicionKind::Expired => "EXPIRED",
            SuspicionKind::RateLimited => "RATE_LIMITED",
        }
    }
}

impl fmt::Display for SuspicionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode transition published to alerting consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub platform_id: String,
    pub from: FailsafeMode,
    pub to: FailsafeMode,
    pub reason: String,
    pub at_ns: u64,
}

/// Challenge signed by the reset authority to release a LOCKED platform.
///
/// Binds the platform and the lock sequence number, so a token only
/// releases the lock it was issued for.
pub fn reset_challenge(platform_id: &str, lock_seq: u64) -> Vec<u8> {
    let mut enc = CanonicalEncoder::new(domains::RESET);
    enc.put_str(platform_id).put_u64(lock_seq);
    enc.into_bytes()
}

/// Out-of-band reset authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetToken {
    pub lock_seq: u64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl ResetToken {
    /// Sign a reset token with the root-of-trust custody
    pub fn sign(
        platform_id: &str,
        lock_seq: u64,
        authority: &dyn KeyCustody,
    ) -> std::result::Result<Self, CryptoError> {
        Ok(Self {
            lock_seq,
            signature: authority.sign(&reset_challenge(platform_id, lock_seq))?,
        })
    }
}

/// Challenge signed by an operator to lift HOLD_FIRE.
///
/// Binds the platform, the operator and the hold sequence number, so a
/// token only lifts the hold it was issued for.
pub fn resume_challenge(platform_id: &str, operator_id: &str, hold_seq: u64) -> Vec<u8> {
    let mut enc = CanonicalEncoder::new(domains::RESUME);
    enc.put_str(platform_id).put_str(operator_id).put_u64(hold_seq);
    enc.into_bytes()
}

/// Operator authorization to resume from HOLD_FIRE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub operator_id: String,
    pub hold_seq: u64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl ResumeToken {
    pub fn sign(
        platform_id: &str,
        operator_id: impl Into<String>,
        hold_seq: u64,
        custody: &dyn KeyCustody,
    ) -> std::result::Result<Self, CryptoError> {
        let operator_id = operator_id.into();
        let signature = custody.sign(&resume_challenge(platform_id, &operator_id, hold_seq))?;
        Ok(Self {
            operator_id,
            hold_seq,
            signature,
        })
    }
}

/// Suspicion escalation, resume and reset policy
#[derive(Debug, Clone)]
pub struct FailsafePolicy {
    pub suspicion_threshold: usize,
    pub suspicion_window: Duration,
    pub reset_authority: Option<PublicKeyBytes>,
    /// Key allowed to lift HOLD_FIRE. The reset authority may always do so too.
    pub resume_authority: Option<PublicKeyBytes>,
}

impl FailsafePolicy {
    pub fn from_config(config: &FailsafeConfig) -> std::result::Result<Self, PolicyError> {
        if config.suspicion_threshold == 0 {
            return Err(PolicyError::Invalid(
                "suspicion_threshold must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            suspicion_threshold: config.suspicion_threshold,
            suspicion_window: Duration::from_secs(config.suspicion_window_secs),
            reset_authority: parse_authority_key(
                "reset_authority_key",
                config.reset_authority_key.as_deref(),
            )?,
            resume_authority: parse_authority_key(
                "resume_authority_key",
                config.resume_authority_key.as_deref(),
            )?,
        })
    }
}

fn parse_authority_key(
    field: &str,
    encoded: Option<&str>,
) -> std::result::Result<Option<PublicKeyBytes>, PolicyError> {
    let Some(encoded) = encoded else {
        return Ok(None);
    };
    let bytes = hex::decode(encoded)
        .map_err(|e| PolicyError::Invalid(format!("{field} is not hex: {e}")))?;
    let key: PublicKeyBytes = bytes.as_slice().try_into().map_err(|_| {
        PolicyError::Invalid(format!("{field} must be 32 bytes, got {}", bytes.len()))
    })?;
    validate_public_key(&key).map_err(|e| PolicyError::Invalid(format!("{field}: {e}")))?;
    Ok(Some(key))
}

struct FailsafeState {
    mode: FailsafeMode,
    /// Timestamps of suspicions inside the window
    suspicions: VecDeque<u64>,
    /// Incremented every time the platform locks
    lock_seq: u64,
    /// Incremented every time the platform enters HOLD_FIRE
    hold_seq: u64,
    subscribers: Vec<Sender<ModeChange>>,
}

/// Owns the mode of one platform.
pub struct FailsafeController {
    platform_id: String,
    policy: FailsafePolicy,
    window_ns: u64,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    state: Mutex<FailsafeState>,
}

impl fmt::Debug for FailsafeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailsafeController")
            .field("platform_id", &self.platform_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FailsafeController {
    /// Controller in NORMAL mode
    pub fn new(
        platform_id: impl Into<String>,
        policy: FailsafePolicy,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            window_ns: duration_to_ns(policy.suspicion_window),
            policy,
            audit,
            clock,
            state: Mutex::new(FailsafeState {
                mode: FailsafeMode::Normal,
                suspicions: VecDeque::new(),
                lock_seq: 0,
                hold_seq: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    pub fn mode(&self) -> Result<FailsafeMode> {
        Ok(self.lock()?.mode)
    }

    /// Gate for incoming commands: only NORMAL admits
    pub fn admit(&self) -> Result<()> {
        match self.mode()? {
            FailsafeMode::Normal => Ok(()),
            mode => Err(FailsafeError::Engaged { mode }),
        }
    }

    /// Record a suspicion. Always leaves the platform in HOLD_FIRE or LOCKED.
    ///
    /// The transition is applied even when the audit record cannot be
    /// written; the audit error is returned afterwards.
    pub fn report_suspicion(&self, kind: SuspicionKind) -> Result<FailsafeMode> {
        let now = self.clock.now_ns();
        let mut state = self.lock()?;

        self.prune_window(&mut state, now);
        state.suspicions.push_back(now);
        let window_count = state.suspicions.len();

        error!(
            platform_id = %self.platform_id,
            suspicion = %kind,
            window_count,
            threshold = self.policy.suspicion_threshold,
            "Suspicion raised"
        );

        let to = if window_count >= self.policy.suspicion_threshold
            || state.mode == FailsafeMode::Locked
        {
            FailsafeMode::Locked
        } else {
            FailsafeMode::HoldFire
        };

        let suspicion_audit = self.audit.append(
            FAILSAFE_SOURCE,
            AuditEvent::SuspicionRaised {
                platform_id: self.platform_id.clone(),
                suspicion: kind.to_string(),
                window_count,
            },
        );

        let reason = format!("{kind} ({window_count} in window)");
        let transition_audit = self.transition(&mut state, to, reason, now);

        suspicion_audit?;
        transition_audit?;
        Ok(to)
    }

    /// Explicit abort or timeout: NORMAL moves to HOLD_FIRE. LOCKED stays LOCKED.
    pub fn hold_fire(&self, reason: &str) -> Result<FailsafeMode> {
        let now = self.clock.now_ns();
        let mut state = self.lock()?;
        if state.mode != FailsafeMode::Normal {
            return Ok(state.mode);
        }
        self.transition(&mut state, FailsafeMode::HoldFire, reason.to_string(), now)?;
        Ok(FailsafeMode::HoldFire)
    }

    /// Operator resume: HOLD_FIRE back to NORMAL with a signed token for the
    /// current hold. Does not release LOCKED, and suspicions stay counted in
    /// the window.
    pub fn resume(&self, token: &ResumeToken) -> Result<()> {
        let now = self.clock.now_ns();
        let mut state = self.lock()?;
        if state.mode != FailsafeMode::HoldFire {
            return Err(FailsafeError::WrongMode {
                required: FailsafeMode::HoldFire,
                actual: state.mode,
            });
        }
        if token.operator_id.trim().is_empty() {
            return Err(FailsafeError::InvalidOperator);
        }
        let authorities: Vec<(&str, PublicKeyBytes)> = [
            (RESUME_AUTHORITY_SIGNER, self.policy.resume_authority),
            (RESET_AUTHORITY_SIGNER, self.policy.reset_authority),
        ]
        .into_iter()
        .filter_map(|(signer, key)| key.map(|k| (signer, k)))
        .collect();
        if authorities.is_empty() {
            return Err(FailsafeError::NoResumeAuthority);
        }

        if token.hold_seq != state.hold_seq {
            warn!(
                platform_id = %self.platform_id,
                token_seq = token.hold_seq,
                hold_seq = state.hold_seq,
                "Resume token for a different hold"
            );
            return Err(FailsafeError::InvalidResumeToken(format!(
                "token is for hold {}, platform is at hold {}",
                token.hold_seq, state.hold_seq
            )));
        }

        let challenge = resume_challenge(&self.platform_id, &token.operator_id, state.hold_seq);
        let Some(authority) = authorities.iter().find_map(|(signer, key)| {
            verify_signature(signer, key, &challenge, &token.signature)
                .ok()
                .map(|()| *key)
        }) else {
            error!(
                platform_id = %self.platform_id,
                operator_id = %token.operator_id,
                "Resume token rejected"
            );
            return Err(FailsafeError::InvalidResumeToken(
                "signature does not verify under any resume authority".to_string(),
            ));
        };

        let authority_id = format!("{} ({})", token.operator_id, key_id_for(&authority));
        let reset_audit = self.audit.append(
            FAILSAFE_SOURCE,
            AuditEvent::FailsafeReset {
                platform_id: self.platform_id.clone(),
                from: FailsafeMode::HoldFire.to_string(),
                authority: authority_id.clone(),
            },
        );
        let transition_audit = self.transition(
            &mut state,
            FailsafeMode::Normal,
            format!("resumed by {authority_id}"),
            now,
        );

        reset_audit?;
        transition_audit?;
        Ok(())
    }

    /// Root-of-trust reset: LOCKED back to NORMAL, clearing the suspicion window.
    pub fn reset_locked(&self, token: &ResetToken) -> Result<()> {
        let now = self.clock.now_ns();
        let mut state = self.lock()?;
        if state.mode != FailsafeMode::Locked {
            return Err(FailsafeError::WrongMode {
                required: FailsafeMode::Locked,
                actual: state.mode,
            });
        }
        let authority = self
            .policy
            .reset_authority
            .ok_or(FailsafeError::NoResetAuthority)?;

        if token.lock_seq != state.lock_seq {
            warn!(
                platform_id = %self.platform_id,
                token_seq = token.lock_seq,
                lock_seq = state.lock_seq,
                "Reset token for a different lock"
            );
            return Err(FailsafeError::InvalidResetToken(format!(
                "token is for lock {}, platform is at lock {}",
                token.lock_seq, state.lock_seq
            )));
        }

        verify_signature(
            RESET_AUTHORITY_SIGNER,
            &authority,
            &reset_challenge(&self.platform_id, state.lock_seq),
            &token.signature,
        )
        .map_err(|e| {
            error!(platform_id = %self.platform_id, error = %e, "Reset token rejected");
            FailsafeError::InvalidResetToken(e.to_string())
        })?;

        state.suspicions.clear();
        let authority_id = key_id_for(&authority);
        let reset_audit = self.audit.append(
            FAILSAFE_SOURCE,
            AuditEvent::FailsafeReset {
                platform_id: self.platform_id.clone(),
                from: FailsafeMode::Locked.to_string(),
                authority: authority_id.clone(),
            },
        );
        let transition_audit = self.transition(
            &mut state,
            FailsafeMode::Normal,
            format!("root-of-trust reset by {authority_id}"),
            now,
        );

        reset_audit?;
        transition_audit?;
        Ok(())
    }

    /// Stream of mode changes after this call
    pub fn subscribe(&self) -> Result<Receiver<ModeChange>> {
        let (tx, rx) = mpsc::channel();
        self.lock()?.subscribers.push(tx);
        Ok(rx)
    }

    /// Suspicions inside the current window
    pub fn suspicion_count(&self) -> Result<usize> {
        let now = self.clock.now_ns();
        let mut state = self.lock()?;
        self.prune_window(&mut state, now);
        Ok(state.suspicions.len())
    }

    /// Sequence number of the most recent lock (0 if never locked)
    pub fn lock_seq(&self) -> Result<u64> {
        Ok(self.lock()?.lock_seq)
    }

    /// Sequence number of the most recent hold (0 if never held)
    pub fn hold_seq(&self) -> Result<u64> {
        Ok(self.lock()?.hold_seq)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FailsafeState>> {
        self.state.lock().map_err(|_| FailsafeError::LockPoisoned)
    }

    fn prune_window(&self, state: &mut FailsafeState, now: u64) {
        let cutoff = now.saturating_sub(self.window_ns);
        while state.suspicions.front().is_some_and(|&t| t < cutoff) {
            state.suspicions.pop_front();
        }
    }

    /// Apply a mode change, notify subscribers, then audit it
    fn transition(
        &self,
        state: &mut FailsafeState,
        to: FailsafeMode,
        reason: String,
        now: u64,
    ) -> Result<()> {
        let from = state.mode;
        if from == to {
            return Ok(());
        }
        state.mode = to;
        match to {
            FailsafeMode::Locked => state.lock_seq += 1,
            FailsafeMode::HoldFire => state.hold_seq += 1,
            FailsafeMode::Normal => {}
        }

        match to {
            FailsafeMode::Locked => error!(
                platform_id = %self.platform_id,
                %from,
                lock_seq = state.lock_seq,
                reason = %reason,
                "Platform LOCKED; root-of-trust reset required"
            ),
            FailsafeMode::HoldFire => warn!(
                platform_id = %self.platform_id,
                %from,
                reason = %reason,
                "Platform in HOLD_FIRE"
            ),
            FailsafeMode::Normal => info!(
                platform_id = %self.platform_id,
                %from,
                reason = %reason,
                "Platform back to NORMAL"
            ),
        }

        let change = ModeChange {
            platform_id: self.platform_id.clone(),
            from,
            to,
            reason: reason.clone(),
            at_ns: now,
        };
        state.subscribers.retain(|tx| tx.send(change.clone()).is_ok());

        self.audit.append(
            FAILSAFE_SOURCE,
            AuditEvent::ModeChanged {
                platform_id: self.platform_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
                reason,
            },
        )?;
        Ok(())
    }
}
