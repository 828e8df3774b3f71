//! Nonce ledger - per-platform record of nonces already executed.
//!
//! Inserts are an atomic insert-if-absent: the presence check and the insert
//! happen under one lock (and, with SQLite, against one primary key), so two
//! concurrent verifications of the same command can never both pass the
//! replay check.
//!
//! Records are kept for the retention window (the longest a command can stay
//! valid, including clock skew) and only pruned after that, so a replay is
//! either caught here or already rejected as expired.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use killswitch_core::time::duration_to_ns;
use killswitch_crypto::Nonce;
use tracing::{debug, info, warn};

use crate::error::NonceLedgerError;

#[cfg(feature = "sqlite")]
use rusqlite::{params, Connection};
#[cfg(feature = "sqlite")]
use std::path::Path;

type Result<T> = std::result::Result<T, NonceLedgerError>;

/// Outcome of [`NonceLedger::check_and_insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Default)]
struct LedgerState {
    /// platform id -> nonce -> seen-at (ns)
    records: HashMap<String, HashMap<Nonce, u64>>,
    #[cfg(feature = "sqlite")]
    db: Option<Connection>,
}

/// Used-nonce ledger, optionally persisted to SQLite.
pub struct NonceLedger {
    retention_ns: u64,
    capacity: usize,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for NonceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLedger")
            .field("retention_ns", &self.retention_ns)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl NonceLedger {
    /// Volatile ledger keeping records for `retention`, at most `capacity`
    /// per platform
    pub fn in_memory(retention: Duration, capacity: usize) -> Self {
        Self {
            retention_ns: duration_to_ns(retention),
            capacity,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Create or open a durable ledger at `path`
    #[cfg(feature = "sqlite")]
    pub fn open(path: impl AsRef<Path>, retention: Duration, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nonces (
                platform_id TEXT NOT NULL,
                nonce BLOB NOT NULL,
                seen_at_ns INTEGER NOT NULL,
                PRIMARY KEY (platform_id, nonce)
            );
            "#,
        )?;

        let mut records: HashMap<String, HashMap<Nonce, u64>> = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT platform_id, nonce, seen_at_ns FROM nonces")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)? as u64,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (platform_id, nonce, seen_at_ns) in rows {
                let bytes: [u8; 16] = nonce.as_slice().try_into().map_err(|_| {
                    NonceLedgerError::CorruptRecord(format!(
                        "nonce for {platform_id} has {} bytes",
                        nonce.len()
                    ))
                })?;
                records
                    .entry(platform_id)
                    .or_default()
                    .insert(Nonce(bytes), seen_at_ns);
            }
        }

        info!(
            path = %path.display(),
            platforms = records.len(),
            nonces = records.values().map(HashMap::len).sum::<usize>(),
            "Nonce ledger opened"
        );

        Ok(Self {
            retention_ns: duration_to_ns(retention),
            capacity,
            state: Mutex::new(LedgerState {
                records,
                db: Some(conn),
            }),
        })
    }

    /// Atomically record `nonce` for `platform_id` unless already present.
    ///
    /// When the platform is at capacity, entries past the retention window
    /// are pruned first; if none can be freed the insert fails closed with
    /// `CapacityExhausted`.
    pub fn check_and_insert(
        &self,
        platform_id: &str,
        nonce: &Nonce,
        seen_at_ns: u64,
    ) -> Result<InsertOutcome> {
        let mut state = self.state.lock().map_err(|_| NonceLedgerError::LockPoisoned)?;

        if state
            .records
            .get(platform_id)
            .is_some_and(|nonces| nonces.contains_key(nonce))
        {
            warn!(platform_id, nonce = %nonce, "Nonce already recorded");
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let count = state.records.get(platform_id).map_or(0, HashMap::len);
        if count >= self.capacity {
            self.prune_locked(&mut state, seen_at_ns)?;
            let count = state.records.get(platform_id).map_or(0, HashMap::len);
            if count >= self.capacity {
                return Err(NonceLedgerError::CapacityExhausted {
                    platform_id: platform_id.to_string(),
                    capacity: self.capacity,
                });
            }
        }

        #[cfg(feature = "sqlite")]
        if let Some(db) = &state.db {
            let inserted = db.execute(
                "INSERT OR IGNORE INTO nonces (platform_id, nonce, seen_at_ns) VALUES (?1, ?2, ?3)",
                params![platform_id, nonce.as_bytes().to_vec(), seen_at_ns as i64],
            )?;
            if inserted == 0 {
                warn!(platform_id, nonce = %nonce, "Nonce already recorded in durable ledger");
                return Ok(InsertOutcome::AlreadyPresent);
            }
        }

        state
            .records
            .entry(platform_id.to_string())
            .or_default()
            .insert(*nonce, seen_at_ns);

        debug!(platform_id, nonce = %nonce, "Nonce recorded");
        Ok(InsertOutcome::Inserted)
    }

    /// Whether `nonce` was already recorded for `platform_id`
    pub fn contains(&self, platform_id: &str, nonce: &Nonce) -> Result<bool> {
        let state = self.state.lock().map_err(|_| NonceLedgerError::LockPoisoned)?;
        Ok(state
            .records
            .get(platform_id)
            .is_some_and(|nonces| nonces.contains_key(nonce)))
    }

    /// Drop records older than the retention window. Returns how many were removed.
    pub fn prune(&self, now_ns: u64) -> Result<usize> {
        let mut state = self.state.lock().map_err(|_| NonceLedgerError::LockPoisoned)?;
        self.prune_locked(&mut state, now_ns)
    }

    /// Records held for `platform_id`
    pub fn len(&self, platform_id: &str) -> Result<usize> {
        let state = self.state.lock().map_err(|_| NonceLedgerError::LockPoisoned)?;
        Ok(state.records.get(platform_id).map_or(0, HashMap::len))
    }

    pub fn is_empty(&self, platform_id: &str) -> Result<bool> {
        Ok(self.len(platform_id)? == 0)
    }

    pub fn retention_ns(&self) -> u64 {
        self.retention_ns
    }

    fn prune_locked(&self, state: &mut LedgerState, now_ns: u64) -> Result<usize> {
        let cutoff = now_ns.saturating_sub(self.retention_ns);

        #[cfg(feature = "sqlite")]
        if let Some(db) = &state.db {
            db.execute(
                "DELETE FROM nonces WHERE seen_at_ns < ?1",
                params![cutoff as i64],
            )?;
        }

        let mut removed = 0;
        for nonces in state.records.values_mut() {
            let before = nonces.len();
            nonces.retain(|_, seen_at| *seen_at >= cutoff);
            removed += before - nonces.len();
        }
        state.records.retain(|_, nonces| !nonces.is_empty());

        if removed > 0 {
            debug!(removed, cutoff_ns = cutoff, "Pruned expired nonces");
        }
        Ok(removed)
    }
}
