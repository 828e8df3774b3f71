//! Black-box audit log - append-only, hash-chained record of protocol events.
//!
//! Every proposal, approval decision, issued command, verification outcome and
//! failsafe transition is appended here. Each entry commits to its
//! predecessor:
//!
//! ```text
//! entry_hash = BLAKE3(prev_hash || canonical_payload)
//! ```
//!
//! where the canonical payload covers the sequence number, timestamp, source
//! and event body. The first entry links to [`GENESIS_HASH`].
//!
//! # Guarantees
//!
//! - Single append path: all appends serialize through one mutex, so the
//!   chain for a log has exactly one order
//! - Append-only: no update or delete operation exists on any store
//! - Tamper evidence: mutating any historical entry breaks recomputation from
//!   that entry forward, and no longer matches any later [`Checkpoint`]
//! - Durable backend: SQLite with WAL mode; the chain is re-verified on open

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::time::Clock;

#[cfg(feature = "sqlite")]
use rusqlite::{params, Connection, OpenFlags};
#[cfg(feature = "sqlite")]
use std::path::Path;

/// 32-byte BLAKE3 digest
pub type Hash = [u8; 32];

/// Previous-hash value of the first entry in every chain
pub const GENESIS_HASH: Hash = [0u8; 32];

/// Errors that can occur in audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Audit chain broken at seq_no {seq_no}: {reason}")]
    ChainBroken { seq_no: u64, reason: String },

    #[error("Checkpoint mismatch at seq_no {seq_no}")]
    CheckpointMismatch { seq_no: u64 },

    #[error("Audit log lock poisoned")]
    LockPoisoned,
}

/// Protocol events recorded in the black box.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    ProposalOpened {
        proposal_id: String,
        action: String,
        proposer_id: String,
        threshold: usize,
        deadline_ns: u64,
    },
    ProposalVetoed {
        proposal_id: String,
        reason: String,
    },
    ApprovalAccepted {
        proposal_id: String,
        officer_id: String,
        count: usize,
        threshold: usize,
    },
    ApprovalRejected {
        proposal_id: String,
        officer_id: String,
        reason: String,
    },
    QuorumSatisfied {
        proposal_id: String,
        count: usize,
    },
    ProposalAborted {
        proposal_id: String,
        reason: String,
    },
    ProposalExpired {
        proposal_id: String,
        count: usize,
    },
    CommandIssued {
        proposal_id: String,
        action: String,
        nonce: String,
        issued_at_ns: u64,
        ttl_secs: u64,
        key_epoch: u64,
        signers: Vec<String>,
    },
    IssueRejected {
        proposal_id: String,
        reason: String,
    },
    CommandVerified {
        platform_id: String,
        proposal_id: String,
        nonce: String,
        outcome: String,
        reason: Option<String>,
    },
    SuspicionRaised {
        platform_id: String,
        suspicion: String,
        window_count: usize,
    },
    ModeChanged {
        platform_id: String,
        from: String,
        to: String,
        reason: String,
    },
    FailsafeReset {
        platform_id: String,
        from: String,
        authority: String,
    },
}

impl AuditEvent {
    /// Stable event kind label
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::ProposalOpened { .. } => "proposal_opened",
            AuditEvent::ProposalVetoed { .. } => "proposal_vetoed",
            AuditEvent::ApprovalAccepted { .. } => "approval_accepted",
            AuditEvent::ApprovalRejected { .. } => "approval_rejected",
            AuditEvent::QuorumSatisfied { .. } => "quorum_satisfied",
            AuditEvent::ProposalAborted { .. } => "proposal_aborted",
            AuditEvent::ProposalExpired { .. } => "proposal_expired",
            AuditEvent::CommandIssued { .. } => "command_issued",
            AuditEvent::IssueRejected { .. } => "issue_rejected",
            AuditEvent::CommandVerified { .. } => "command_verified",
            AuditEvent::SuspicionRaised { .. } => "suspicion_raised",
            AuditEvent::ModeChanged { .. } => "mode_changed",
            AuditEvent::FailsafeReset { .. } => "failsafe_reset",
        }
    }
}

/// A single hash-chained audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    /// Position in the chain, starting at 1
    pub seq_no: u64,
    /// Append time (nanoseconds since epoch)
    pub timestamp_ns: u64,
    /// Component that wrote the entry
    pub source: String,
    /// Event body
    pub event: AuditEvent,
    /// Hash of the previous entry ([`GENESIS_HASH`] for the first)
    pub prev_hash: Hash,
    /// BLAKE3(prev_hash || payload)
    pub entry_hash: Hash,
}

#[derive(Serialize)]
struct PayloadView<'a> {
    seq_no: u64,
    timestamp_ns: u64,
    source: &'a str,
    event: &'a AuditEvent,
}

impl AuditEntry {
    fn build(
        seq_no: u64,
        timestamp_ns: u64,
        source: String,
        event: AuditEvent,
        prev_hash: Hash,
    ) -> Result<Self, AuditError> {
        let payload = payload_bytes(seq_no, timestamp_ns, &source, &event)?;
        let entry_hash = compute_entry_hash(&prev_hash, &payload);
        Ok(Self {
            seq_no,
            timestamp_ns,
            source,
            event,
            prev_hash,
            entry_hash,
        })
    }

    /// Canonical bytes covered by the entry hash
    pub fn payload_bytes(&self) -> Result<Vec<u8>, AuditError> {
        payload_bytes(self.seq_no, self.timestamp_ns, &self.source, &self.event)
    }

    /// Recompute this entry's hash from its content and stated predecessor
    pub fn recompute_hash(&self) -> Result<Hash, AuditError> {
        Ok(compute_entry_hash(&self.prev_hash, &self.payload_bytes()?))
    }
}

fn payload_bytes(
    seq_no: u64,
    timestamp_ns: u64,
    source: &str,
    event: &AuditEvent,
) -> Result<Vec<u8>, AuditError> {
    Ok(serde_json::to_vec(&PayloadView {
        seq_no,
        timestamp_ns,
        source,
        event,
    })?)
}

/// entry_hash = BLAKE3(prev_hash || payload)
pub fn compute_entry_hash(prev_hash: &Hash, payload: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Head of the chain at some point in time, handed to external custody.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Sequence number of the last entry covered (0 for an empty log)
    pub seq_no: u64,
    /// Entry hash at `seq_no` ([`GENESIS_HASH`] for an empty log)
    pub head_hash: Hash,
}

/// Verify stored chain consistency: contiguous sequence numbers from 1,
/// correct back-links, and hashes that match recomputation.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev_hash = GENESIS_HASH;

    for (i, entry) in entries.iter().enumerate() {
        let expected_seq_no = i as u64 + 1;
        if entry.seq_no != expected_seq_no {
            return Err(AuditError::ChainBroken {
                seq_no: entry.seq_no,
                reason: format!("expected seq_no {}", expected_seq_no),
            });
        }

        if entry.prev_hash != prev_hash {
            return Err(AuditError::ChainBroken {
                seq_no: entry.seq_no,
                reason: format!(
                    "prev_hash {} does not link to {}",
                    hex::encode(entry.prev_hash),
                    hex::encode(prev_hash)
                ),
            });
        }

        let recomputed = entry.recompute_hash()?;
        if recomputed != entry.entry_hash {
            return Err(AuditError::ChainBroken {
                seq_no: entry.seq_no,
                reason: "entry content does not match entry_hash".to_string(),
            });
        }

        prev_hash = entry.entry_hash;
    }

    Ok(())
}

/// Recompute the chain from genesis using only entry content and compare
/// the result at `checkpoint.seq_no` with the externally held head hash.
///
/// Unlike [`verify_chain`], this detects a rewrite that also recomputed and
/// replaced every stored hash after the tampered entry.
pub fn verify_against_checkpoint(
    entries: &[AuditEntry],
    checkpoint: &Checkpoint,
) -> Result<(), AuditError> {
    if checkpoint.seq_no == 0 {
        return if checkpoint.head_hash == GENESIS_HASH {
            Ok(())
        } else {
            Err(AuditError::CheckpointMismatch { seq_no: 0 })
        };
    }

    let mut running = GENESIS_HASH;
    for entry in entries.iter().take_while(|e| e.seq_no <= checkpoint.seq_no) {
        running = compute_entry_hash(&running, &entry.payload_bytes()?);
        if entry.seq_no == checkpoint.seq_no {
            return if running == checkpoint.head_hash {
                Ok(())
            } else {
                Err(AuditError::CheckpointMismatch {
                    seq_no: checkpoint.seq_no,
                })
            };
        }
    }

    Err(AuditError::CheckpointMismatch {
        seq_no: checkpoint.seq_no,
    })
}

/// Persistence backend for audit entries. Stores never update or delete.
pub trait AuditStore: Send {
    /// Durably persist one entry
    fn persist(&mut self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Load every entry in sequence order
    fn load(&self) -> Result<Vec<AuditEntry>, AuditError>;
}

/// Volatile store for tests and simulations
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: Vec<AuditEntry>,
}

impl AuditStore for MemoryAuditStore {
    fn persist(&mut self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self.entries.clone())
    }
}

/// SQLite-backed store (WAL mode)
#[cfg(feature = "sqlite")]
pub struct SqliteAuditStore {
    conn: Connection,
}

#[cfg(feature = "sqlite")]
impl SqliteAuditStore {
    /// Create or open the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                seq_no INTEGER PRIMARY KEY,
                timestamp_ns INTEGER NOT NULL,
                source TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                event_json TEXT NOT NULL,
                prev_hash BLOB NOT NULL,
                entry_hash BLOB NOT NULL
            );
            "#,
        )?;

        Ok(Self { conn })
    }
}

#[cfg(feature = "sqlite")]
impl AuditStore for SqliteAuditStore {
    fn persist(&mut self, entry: &AuditEntry) -> Result<(), AuditError> {
        let event_json = serde_json::to_string(&entry.event)?;
        self.conn.execute(
            r#"
            INSERT INTO audit_entries (
                seq_no, timestamp_ns, source, event_kind, event_json, prev_hash, entry_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.seq_no as i64,
                entry.timestamp_ns as i64,
                entry.source,
                entry.event.kind(),
                event_json,
                entry.prev_hash.to_vec(),
                entry.entry_hash.to_vec(),
            ],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq_no, timestamp_ns, source, event_json, prev_hash, entry_hash
            FROM audit_entries
            ORDER BY seq_no ASC
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq_no, timestamp_ns, source, event_json, prev, hash)| {
                Ok(AuditEntry {
                    seq_no,
                    timestamp_ns,
                    source,
                    event: serde_json::from_str(&event_json)?,
                    prev_hash: to_hash(seq_no, &prev)?,
                    entry_hash: to_hash(seq_no, &hash)?,
                })
            })
            .collect()
    }
}

#[cfg(feature = "sqlite")]
fn to_hash(seq_no: u64, bytes: &[u8]) -> Result<Hash, AuditError> {
    bytes.try_into().map_err(|_| AuditError::ChainBroken {
        seq_no,
        reason: format!("stored hash has {} bytes", bytes.len()),
    })
}

/// Observability counters
#[derive(Debug, Default, Clone)]
pub struct AuditMetrics {
    pub entries_appended_total: u64,
    pub append_failures_total: u64,
}

struct AuditInner {
    store: Box<dyn AuditStore>,
    head: Checkpoint,
    subscribers: Vec<Sender<AuditEntry>>,
    metrics: AuditMetrics,
}

/// Append-only, hash-chained audit log with a single serialized writer.
pub struct AuditLog {
    log_id: String,
    clock: Arc<dyn Clock>,
    inner: Mutex<AuditInner>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("log_id", &self.log_id)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Volatile log
    pub fn in_memory(log_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(log_id, clock, Box::<MemoryAuditStore>::default(), GENESIS_CHECKPOINT)
    }

    /// Create or open a durable log; refuses to open a chain that fails verification.
    #[cfg(feature = "sqlite")]
    pub fn open(
        path: impl AsRef<Path>,
        log_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuditError> {
        let log_id = log_id.into();
        let path = path.as_ref();

        info!(log_id = %log_id, path = %path.display(), "Opening audit log");

        let store = SqliteAuditStore::open(path)?;
        let entries = store.load()?;

        if let Err(e) = verify_chain(&entries) {
            error!(log_id = %log_id, error = %e, "Audit chain verification failed on open");
            return Err(e);
        }

        let head = entries
            .last()
            .map(|e| Checkpoint {
                seq_no: e.seq_no,
                head_hash: e.entry_hash,
            })
            .unwrap_or(GENESIS_CHECKPOINT);

        info!(log_id = %log_id, entry_count = entries.len(), "Audit chain verified");

        Ok(Self::with_store(log_id, clock, Box::new(store), head))
    }

    fn with_store(
        log_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        store: Box<dyn AuditStore>,
        head: Checkpoint,
    ) -> Self {
        Self {
            log_id: log_id.into(),
            clock,
            inner: Mutex::new(AuditInner {
                store,
                head,
                subscribers: Vec::new(),
                metrics: AuditMetrics::default(),
            }),
        }
    }

    /// Append an event. The entry is persisted before it is published to subscribers.
    pub fn append(&self, source: &str, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let mut inner = self.inner.lock().map_err(|_| AuditError::LockPoisoned)?;

        let seq_no = inner.head.seq_no + 1;
        let entry = AuditEntry::build(
            seq_no,
            self.clock.now_ns(),
            source.to_string(),
            event,
            inner.head.head_hash,
        )?;

        if let Err(e) = inner.store.persist(&entry) {
            inner.metrics.append_failures_total += 1;
            error!(log_id = %self.log_id, seq_no, error = %e, "Audit append failed");
            return Err(e);
        }

        inner.head = Checkpoint {
            seq_no,
            head_hash: entry.entry_hash,
        };
        inner.metrics.entries_appended_total += 1;
        inner.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());

        debug!(
            log_id = %self.log_id,
            seq_no,
            kind = entry.event.kind(),
            source = %entry.source,
            "Audit entry appended"
        );

        Ok(entry)
    }

    /// Read-only stream of entries appended after this call
    pub fn subscribe(&self) -> Result<Receiver<AuditEntry>, AuditError> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .lock()
            .map_err(|_| AuditError::LockPoisoned)?
            .subscribers
            .push(tx);
        Ok(rx)
    }

    /// Current chain head
    pub fn checkpoint(&self) -> Result<Checkpoint, AuditError> {
        Ok(self.inner.lock().map_err(|_| AuditError::LockPoisoned)?.head)
    }

    /// All entries in sequence order
    pub fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner
            .lock()
            .map_err(|_| AuditError::LockPoisoned)?
            .store
            .load()
    }

    /// Re-verify the stored chain
    pub fn verify(&self) -> Result<(), AuditError> {
        verify_chain(&self.entries()?)
    }

    /// Append counters
    pub fn metrics(&self) -> Result<AuditMetrics, AuditError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| AuditError::LockPoisoned)?
            .metrics
            .clone())
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }
}

const GENESIS_CHECKPOINT: Checkpoint = Checkpoint {
    seq_no: 0,
    head_hash: GENESIS_HASH,
};
