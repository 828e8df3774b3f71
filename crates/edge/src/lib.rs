//! Platform-side enforcement for the kill-switch control plane.
//!
//! Everything here runs on the receiving platform:
//! - [`CommandVerifier`]: signature, validity window, replay and applicability checks
//! - [`NonceLedger`]: durable record of executed nonces
//! - [`FailsafeController`]: NORMAL / HOLD_FIRE / LOCKED mode with suspicion escalation
//! - [`RateLimiter`]: command flood detection

pub mod error;
pub mod failsafe;
pub mod nonce_ledger;
pub mod rate_limit;
pub mod verifier;

pub use error::{FailsafeError, NonceLedgerError, PolicyError, VerifyError};
pub use failsafe::{
    reset_challenge, resume_challenge, FailsafeController, FailsafeMode, FailsafePolicy,
    ModeChange, ResetToken, ResumeToken, SuspicionKind, FAILSAFE_SOURCE,
};
pub use nonce_ledger::{InsertOutcome, NonceLedger};
pub use rate_limit::{RateDecision, RateLimiter};
pub use verifier::{
    CommandInstance, CommandState, CommandVerifier, PlatformPolicy, ValidatedCommand,
    VerificationReport, VERIFIER_SOURCE,
};
