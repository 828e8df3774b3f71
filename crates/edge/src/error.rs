//! Platform-side error types

use killswitch_core::AuditError;
use thiserror::Error;

use crate::failsafe::{FailsafeMode, SuspicionKind};

/// Why a command resolved to HOLD_FIRE instead of EXECUTE.
///
/// Verification-path errors are never retried: each one is audited and
/// leaves the command in HOLD_FIRE.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Command outside validity window (issued_at {issued_at_ns}, ttl {ttl_secs}s, now {now_ns})")]
    Expired {
        issued_at_ns: u64,
        ttl_secs: u64,
        now_ns: u64,
    },

    #[error("Replay detected: nonce {nonce}")]
    ReplayDetected { nonce: String },

    /// Not an alarm: the command is valid but not for this platform
    #[error("Not applicable: {0}")]
    NotApplicable(String),

    #[error("Rate limited: {count} commands within {window_secs}s")]
    RateLimited { count: usize, window_secs: u64 },

    #[error("Nonce ledger capacity exhausted for {platform_id} ({capacity} entries)")]
    CapacityExhausted { platform_id: String, capacity: usize },

    #[error("Nonce ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Failsafe engaged: platform in {mode}")]
    FailsafeEngaged { mode: FailsafeMode },

    #[error("Failsafe state unavailable: {0}")]
    FailsafeUnavailable(String),

    #[error("Audit log unavailable: {0}")]
    AuditUnavailable(String),
}

impl VerifyError {
    /// Suspicion raised by this failure, if it is a possible attack signal
    pub fn suspicion(&self) -> Option<SuspicionKind> {
        match self {
            VerifyError::InvalidSignature(_) => Some(SuspicionKind::InvalidSignature),
            VerifyError::Expired { .. } => Some(SuspicionKind::Expired),
            VerifyError::ReplayDetected { .. } => Some(SuspicionKind::ReplayDetected),
            VerifyError::RateLimited { .. } => Some(SuspicionKind::RateLimited),
            _ => None,
        }
    }

    /// Stable label for audit records and decisions
    pub fn label(&self) -> &'static str {
        match self {
            VerifyError::InvalidSignature(_) => "INVALID_SIGNATURE",
            VerifyError::Expired { .. } => "EXPIRED",
            VerifyError::ReplayDetected { .. } => "REPLAY_DETECTED",
            VerifyError::NotApplicable(_) => "NOT_APPLICABLE",
            VerifyError::RateLimited { .. } => "RATE_LIMITED",
            VerifyError::CapacityExhausted { .. } => "CAPACITY_EXHAUSTED",
            VerifyError::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            VerifyError::FailsafeEngaged { .. } => "FAILSAFE_ENGAGED",
            VerifyError::FailsafeUnavailable(_) => "FAILSAFE_UNAVAILABLE",
            VerifyError::AuditUnavailable(_) => "AUDIT_UNAVAILABLE",
        }
    }
}

/// Nonce ledger errors
#[derive(Debug, Error)]
pub enum NonceLedgerError {
    #[error("Nonce ledger capacity exhausted for {platform_id} ({capacity} entries)")]
    CapacityExhausted { platform_id: String, capacity: usize },

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt nonce record: {0}")]
    CorruptRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Nonce ledger lock poisoned")]
    LockPoisoned,
}

/// Failsafe controller errors
#[derive(Debug, Error)]
pub enum FailsafeError {
    #[error("Platform is in {mode}")]
    Engaged { mode: FailsafeMode },

    #[error("Operation requires {required}, platform is in {actual}")]
    WrongMode {
        required: FailsafeMode,
        actual: FailsafeMode,
    },

    #[error("Invalid operator id")]
    InvalidOperator,

    #[error("No reset authority key provisioned")]
    NoResetAuthority,

    #[error("Invalid reset token: {0}")]
    InvalidResetToken(String),

    #[error("No resume authority key provisioned")]
    NoResumeAuthority,

    #[error("Invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("Audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error("Failsafe state lock poisoned")]
    LockPoisoned,
}

/// Platform setup errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid platform policy: {0}")]
    Invalid(String),
}
