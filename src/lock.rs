//! Named, expiring leases so that only one process runs each periodic loop.
//!
//! A lease is held until its TTL elapses or its holder releases it. Holders
//! renew by acquiring again before expiry.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::db::{format_timestamp, now, open_database, open_memory_database, DatabaseError};

pub const REFILL_INTAKE_LEASE: &str = "refill-intake";
pub const TRANSMISSION_ERRORS_LEASE: &str = "transmission-errors";
pub const SWEEPER_LEASE: &str = "status-sweeper";

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Internal lock error")]
    LockPoisoned,
}

impl From<rusqlite::Error> for LeaseError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(DatabaseError::from(e))
    }
}

pub trait LeaseLock: Send + Sync {
    /// Take or renew `name` for `ttl`. False when another holder has it.
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Give up `name` if this holder has it.
    fn release(&self, name: &str) -> Result<(), LeaseError>;

    fn is_held(&self, name: &str) -> Result<bool, LeaseError>;
}

// ═══════════════════════════════════════════════════════════
// SQLite leases
// ═══════════════════════════════════════════════════════════

pub struct SqliteLease {
    conn: Mutex<Connection>,
    holder: String,
}

impl SqliteLease {
    pub fn open(path: &Path, holder: &str) -> Result<Self, LeaseError> {
        Ok(Self::new(open_database(path)?, holder))
    }

    pub fn open_in_memory(holder: &str) -> Result<Self, LeaseError> {
        Ok(Self::new(open_memory_database()?, holder))
    }

    pub fn new(conn: Connection, holder: &str) -> Self {
        Self {
            conn: Mutex::new(conn),
            holder: holder.to_string(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl LeaseLock for SqliteLease {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let at = now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| at.checked_add_signed(d))
            .unwrap_or(chrono::NaiveDateTime::MAX);

        let conn = self.conn.lock().map_err(|_| LeaseError::LockPoisoned)?;
        let changed = conn.execute(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4",
            params![
                name,
                self.holder,
                format_timestamp(&expires_at),
                format_timestamp(&at)
            ],
        )?;
        Ok(changed > 0)
    }

    fn release(&self, name: &str) -> Result<(), LeaseError> {
        let conn = self.conn.lock().map_err(|_| LeaseError::LockPoisoned)?;
        conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
            params![name, self.holder],
        )?;
        Ok(())
    }

    fn is_held(&self, name: &str) -> Result<bool, LeaseError> {
        let conn = self.conn.lock().map_err(|_| LeaseError::LockPoisoned)?;
        let held: i64 = conn.query_row(
            "SELECT COUNT(*) FROM leases WHERE name = ?1 AND holder = ?2 AND expires_at > ?3",
            params![name, self.holder, format_timestamp(&now())],
            |row| row.get(0),
        )?;
        Ok(held > 0)
    }
}

// ═══════════════════════════════════════════════════════════
// Guard
// ═══════════════════════════════════════════════════════════

/// RAII lease. Releases on drop.
pub struct LeaseGuard<'a> {
    lock: &'a dyn LeaseLock,
    name: String,
}

impl LeaseGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(&self.name) {
            tracing::warn!(lease = %self.name, error = %e, "Failed to release lease");
        }
    }
}

/// Acquire `name`, or `None` if someone else holds it. Storage errors are
/// logged and treated as "not acquired".
pub fn try_lease<'a>(lock: &'a dyn LeaseLock, name: &str, ttl: Duration) -> Option<LeaseGuard<'a>> {
    match lock.try_acquire(name, ttl) {
        Ok(true) => Some(LeaseGuard {
            lock,
            name: name.to_string(),
        }),
        Ok(false) => {
            tracing::debug!(lease = %name, "Lease held elsewhere, skipping");
            None
        }
        Err(e) => {
            tracing::warn!(lease = %name, error = %e, "Lease acquisition failed");
            None
        }
    }
}
