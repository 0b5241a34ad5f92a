//! Schema migrations, applied in order when a [`Database`] is opened.
//!
//! `PRAGMA user_version` records the last applied step. Each step runs in
//! its own transaction together with the version bump.
//!
//! [`Database`]: crate::Database

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered migration steps; the position is the version it produces.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at version {current}, newer than this build ({CURRENT_VERSION})"
        )));
    }

    for (idx, (name, step)) in STEPS.iter().enumerate().skip(current as usize) {
        let version = idx as u32 + 1;
        tracing::info!(migration = name, version, "applying migration");
        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
