//! KeyShareStore - enrolled officers, their public key shares, and the
//! group verification key derived from them.
//!
//! Officer private material never reaches this store; it only holds public
//! shares and verifies signatures made inside the officers' custody devices.
//! Revocation is a permanent flag: no operation removes an officer, and the
//! SQLite backend has no DELETE path.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use killswitch_core::time::Clock;
use killswitch_crypto::{
    validate_public_key, verify_signature, GroupVerificationKey, PublicKeyBytes,
};
use tracing::{debug, info, warn};

use crate::error::{IdentityError, Result};
use crate::officer::{OfficerIdentity, Revocation};

#[cfg(feature = "sqlite")]
use rusqlite::{params, Connection};
#[cfg(feature = "sqlite")]
use std::path::Path;
#[cfg(feature = "sqlite")]
use std::sync::Mutex;

/// Officer registry backed by memory, optionally mirrored to SQLite.
pub struct KeyShareStore {
    clock: Arc<dyn Clock>,
    officers: RwLock<BTreeMap<String, OfficerIdentity>>,
    #[cfg(feature = "sqlite")]
    db: Option<Mutex<Connection>>,
}

impl std::fmt::Debug for KeyShareStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShareStore").finish_non_exhaustive()
    }
}

impl KeyShareStore {
    /// Volatile store
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            officers: RwLock::new(BTreeMap::new()),
            #[cfg(feature = "sqlite")]
            db: None,
        }
    }

    /// Create or open a durable store at `path`
    #[cfg(feature = "sqlite")]
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS officers (
                officer_id TEXT PRIMARY KEY,
                public_key BLOB NOT NULL,
                role TEXT NOT NULL,
                enrolled_at_ns INTEGER NOT NULL,
                revoked_at_ns INTEGER,
                revocation_reason TEXT
            );
            "#,
        )?;

        let officers = load_officers(&conn)?;
        info!(
            path = %path.display(),
            enrolled = officers.len(),
            "Key share store opened"
        );

        Ok(Self {
            clock,
            officers: RwLock::new(officers),
            db: Some(Mutex::new(conn)),
        })
    }

    /// Enroll an officer's public key share.
    pub fn enroll(
        &self,
        officer_id: impl Into<String>,
        public_key: PublicKeyBytes,
        role: impl Into<String>,
    ) -> Result<OfficerIdentity> {
        let officer_id = officer_id.into();
        validate_public_key(&public_key).map_err(|e| IdentityError::InvalidKeyShare {
            officer_id: officer_id.clone(),
            reason: e.to_string(),
        })?;

        let mut officers = self
            .officers
            .write()
            .map_err(|_| IdentityError::LockPoisoned)?;

        if officers.contains_key(&officer_id) {
            return Err(IdentityError::AlreadyEnrolled { officer_id });
        }
        if let Some(holder) = officers.values().find(|o| o.public_key == public_key) {
            return Err(IdentityError::InvalidKeyShare {
                officer_id,
                reason: format!("key share already enrolled for {}", holder.officer_id),
            });
        }

        let officer = OfficerIdentity {
            officer_id: officer_id.clone(),
            public_key,
            role: role.into(),
            enrolled_at_ns: self.clock.now_ns(),
            revocation: None,
        };
        self.persist_enrollment(&officer)?;
        officers.insert(officer_id, officer.clone());

        info!(
            officer_id = %officer.officer_id,
            key_id = %officer.key_id(),
            role = %officer.role,
            "Officer enrolled"
        );
        Ok(officer)
    }

    /// Permanently revoke an officer.
    pub fn revoke(&self, officer_id: &str, reason: impl Into<String>) -> Result<OfficerIdentity> {
        let mut officers = self
            .officers
            .write()
            .map_err(|_| IdentityError::LockPoisoned)?;

        let officer = officers
            .get_mut(officer_id)
            .ok_or_else(|| IdentityError::UnknownOfficer {
                officer_id: officer_id.to_string(),
            })?;
        if officer.is_revoked() {
            return Err(IdentityError::AlreadyRevoked {
                officer_id: officer_id.to_string(),
            });
        }

        let revocation = Revocation {
            revoked_at_ns: self.clock.now_ns(),
            reason: reason.into(),
        };
        self.persist_revocation(officer_id, &revocation)?;

        warn!(officer_id, reason = %revocation.reason, "Officer revoked");
        officer.revocation = Some(revocation);
        Ok(officer.clone())
    }

    pub fn get(&self, officer_id: &str) -> Result<Option<OfficerIdentity>> {
        Ok(self
            .officers
            .read()
            .map_err(|_| IdentityError::LockPoisoned)?
            .get(officer_id)
            .cloned())
    }

    /// The officer if enrolled and not revoked
    pub fn require_active(&self, officer_id: &str) -> Result<OfficerIdentity> {
        match self.get(officer_id)? {
            None => Err(IdentityError::UnknownOfficer {
                officer_id: officer_id.to_string(),
            }),
            Some(o) if o.is_revoked() => Err(IdentityError::RevokedOfficer {
                officer_id: officer_id.to_string(),
            }),
            Some(o) => Ok(o),
        }
    }

    /// Verify an approval signature against the officer's enrolled share.
    ///
    /// Fails with `UnknownOfficer`, `RevokedOfficer` or `InvalidSignature`,
    /// checked in that order.
    pub fn verify_approval(
        &self,
        officer_id: &str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<OfficerIdentity> {
        let officer = self.require_active(officer_id)?;
        verify_signature(officer_id, &officer.public_key, message, signature).map_err(|e| {
            IdentityError::InvalidSignature {
                officer_id: officer_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(officer_id, "Approval signature verified");
        Ok(officer)
    }

    /// Every enrolled officer, revoked ones included
    pub fn officers(&self) -> Result<Vec<OfficerIdentity>> {
        Ok(self
            .officers
            .read()
            .map_err(|_| IdentityError::LockPoisoned)?
            .values()
            .cloned()
            .collect())
    }

    /// M: enrolled officers, revoked ones included
    pub fn enrolled_count(&self) -> Result<usize> {
        Ok(self
            .officers
            .read()
            .map_err(|_| IdentityError::LockPoisoned)?
            .len())
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self
            .officers
            .read()
            .map_err(|_| IdentityError::LockPoisoned)?
            .values()
            .filter(|o| o.is_active())
            .count())
    }

    /// Group verification key over the currently active officers
    pub fn group_key(
        &self,
        threshold: usize,
        issuer_key: PublicKeyBytes,
        key_epoch: u64,
    ) -> Result<GroupVerificationKey> {
        let members = self
            .officers
            .read()
            .map_err(|_| IdentityError::LockPoisoned)?
            .values()
            .filter(|o| o.is_active())
            .map(|o| (o.officer_id.clone(), o.public_key))
            .collect();
        Ok(GroupVerificationKey::new(
            key_epoch, threshold, members, issuer_key,
        )?)
    }

    #[cfg(feature = "sqlite")]
    fn persist_enrollment(&self, officer: &OfficerIdentity) -> Result<()> {
        if let Some(db) = &self.db {
            db.lock()
                .map_err(|_| IdentityError::LockPoisoned)?
                .execute(
                    r#"
                    INSERT INTO officers (officer_id, public_key, role, enrolled_at_ns)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![
                        officer.officer_id,
                        officer.public_key.to_vec(),
                        officer.role,
                        officer.enrolled_at_ns as i64,
                    ],
                )?;
        }
        Ok(())
    }

    #[cfg(feature = "sqlite")]
    fn persist_revocation(&self, officer_id: &str, revocation: &Revocation) -> Result<()> {
        if let Some(db) = &self.db {
            db.lock()
                .map_err(|_| IdentityError::LockPoisoned)?
                .execute(
                    r#"
                    UPDATE officers SET revoked_at_ns = ?2, revocation_reason = ?3
                    WHERE officer_id = ?1 AND revoked_at_ns IS NULL
                    "#,
                    params![officer_id, revocation.revoked_at_ns as i64, revocation.reason],
                )?;
        }
        Ok(())
    }

    #[cfg(not(feature = "sqlite"))]
    fn persist_enrollment(&self, _officer: &OfficerIdentity) -> Result<()> {
        Ok(())
    }

    #[cfg(not(feature = "sqlite"))]
    fn persist_revocation(&self, _officer_id: &str, _revocation: &Revocation) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
fn load_officers(conn: &Connection) -> Result<BTreeMap<String, OfficerIdentity>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT officer_id, public_key, role, enrolled_at_ns, revoked_at_ns, revocation_reason
        FROM officers
        "#,
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? as u64,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(officer_id, key, role, enrolled_at_ns, revoked_at, reason)| {
            let public_key: PublicKeyBytes =
                key.as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::InvalidKeyShare {
                        officer_id: officer_id.clone(),
                        reason: format!("stored key has {} bytes", key.len()),
                    })?;
            let revocation = revoked_at.map(|at| Revocation {
                revoked_at_ns: at as u64,
                reason: reason.unwrap_or_default(),
            });
            Ok((
                officer_id.clone(),
                OfficerIdentity {
                    officer_id,
                    public_key,
                    role,
                    enrolled_at_ns,
                    revocation,
                },
            ))
        })
        .collect()
}
