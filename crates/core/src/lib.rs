//! Core functionality for the kill-switch control plane.
//!
//! This crate provides the ambient pieces shared by the authority side and
//! every receiving platform: configuration, structured logging, the time
//! source, and the hash-chained black-box audit log.

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use audit::{
    compute_entry_hash, verify_against_checkpoint, verify_chain, AuditEntry, AuditError,
    AuditEvent, AuditLog, AuditMetrics, AuditStore, Checkpoint, Hash, MemoryAuditStore,
    GENESIS_HASH,
};
#[cfg(feature = "sqlite")]
pub use audit::SqliteAuditStore;
pub use config::{Config, ConfigError, MAX_COMMAND_TTL_CEILING_SECS};
pub use error::{Error, Result};
pub use time::{secs_to_ns, Clock, ManualClock, SystemClock, NANOS_PER_SEC};
