//! Advisory per-key lease locks.
//!
//! A lock row carries its creation time, lease length, and holder session.
//! Expiry is computed against the backend's clock, never the caller's, so
//! every participant measures the lease with the same clock. Expired rows
//! are reclaimed in place by the next acquisition attempt; there is no
//! background sweeper.

use rusqlite::types::Value;
use snafu::ResultExt;
use tracing::debug;

use crate::error::{ExecuteSnafu, QuerySnafu, Result};
use crate::store::Store;
use crate::template::QueryId;

/// Outcome of one [`try_lock`](Store::try_lock) attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTicket {
    /// Zero when the lock was acquired; otherwise the milliseconds left on
    /// the current holder's lease.
    pub wait_millis: i64,
    /// The session now holding the lock. Equal to the caller's session on
    /// acquisition.
    pub holder: String,
}

impl LockTicket {
    /// Whether this attempt acquired the lock.
    pub fn acquired(&self) -> bool {
        self.wait_millis == 0
    }
}

impl Store {
    /// Attempt to take the lease lock on `key` for `lease_millis`.
    ///
    /// Three outcomes, decided on one row read:
    /// - no lock row: insert one and acquire;
    /// - row present but its lease has expired: take it over in place;
    /// - row present and live: no write at all, report the holder and the
    ///   remaining lease. The pure-read path deliberately commits nothing.
    pub fn try_lock(
        &self,
        index: &str,
        key: &str,
        lease_millis: i64,
        session: &str,
    ) -> Result<LockTicket> {
        let mut conn = self.ensure(index)?;
        let select = self.templates.render_static(QueryId::SelectLock, index)?;

        let row = conn
            .query_row_opt(&select, &[Value::Text(key.to_string())], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context(QuerySnafu)?;

        match row {
            None => {
                let insert = self.templates.render_static(QueryId::InsertLock, index)?;
                conn.in_transaction(|tx| {
                    tx.execute(
                        &insert,
                        &[
                            Value::Text(key.to_string()),
                            Value::Integer(lease_millis),
                            Value::Text(session.to_string()),
                        ],
                    )
                    .context(ExecuteSnafu)?;
                    Ok(())
                })?;
                debug!(index, key, session, lease_millis, "lock acquired");
                Ok(LockTicket {
                    wait_millis: 0,
                    holder: session.to_string(),
                })
            }
            Some((now, created_at, wait_for, holder)) => {
                let remaining = created_at + wait_for - now;
                if remaining <= 0 {
                    let update = self.templates.render_static(QueryId::UpdateLock, index)?;
                    conn.in_transaction(|tx| {
                        tx.execute(
                            &update,
                            &[
                                Value::Integer(lease_millis),
                                Value::Text(session.to_string()),
                                Value::Text(key.to_string()),
                            ],
                        )
                        .context(ExecuteSnafu)?;
                        Ok(())
                    })?;
                    debug!(
                        index,
                        key,
                        session,
                        expired_holder = %holder,
                        "expired lock taken over"
                    );
                    Ok(LockTicket {
                        wait_millis: 0,
                        holder: session.to_string(),
                    })
                } else {
                    debug!(index, key, holder = %holder, remaining, "lock is held");
                    Ok(LockTicket {
                        wait_millis: remaining,
                        holder,
                    })
                }
            }
        }
    }

    /// Release the lock on `key`. Deleting an absent row is a no-op.
    pub fn unlock(&self, index: &str, key: &str) -> Result<()> {
        let mut conn = self.ensure(index)?;
        let delete = self.templates.render_static(QueryId::DeleteLock, index)?;
        let deleted = conn.in_transaction(|tx| {
            tx.execute(&delete, &[Value::Text(key.to_string())])
                .context(ExecuteSnafu)
        })?;
        if deleted > 0 {
            debug!(index, key, "lock released");
        }
        Ok(())
    }
}
