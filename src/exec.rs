//! Transactional batch execution
//!
//! Runs heterogeneous-shape row operations as one atomic transaction,
//! caching compiled statements by column signature so a statement is
//! compiled once per distinct row shape, not once per row.

use crate::schema::make_named_parameter;
use crate::types::SqlRow;
use crate::{DatabankError, Result};
use rusqlite::{Connection, Statement};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Map SQLite constraint failures to the crate's constraint error.
pub(crate) fn map_sqlite_error(e: rusqlite::Error) -> DatabankError {
    match e {
        rusqlite::Error::SqliteFailure(f, msg)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DatabankError::Constraint(msg.unwrap_or_else(|| f.to_string()))
        }
        other => DatabankError::Sqlite(other),
    }
}

/// Execute one statement per row inside a single transaction.
///
/// `statement_for` is called once per distinct column signature to
/// produce the SQL text; the compiled statement is cached and reused for
/// every row sharing that signature. Rows are applied in input order.
/// Values bind through their named parameter token when the statement
/// declares one, positionally otherwise.
///
/// The batch is atomic: any row error rolls the whole transaction back
/// and propagates, so either every row is applied or none are. All
/// compiled statements are finalized whichever way the batch ends.
pub fn execute_many<F>(conn: &Connection, mut statement_for: F, rows: &[SqlRow]) -> Result<()>
where
    F: FnMut(&[String]) -> Result<String>,
{
    if rows.is_empty() {
        return Ok(());
    }

    conn.execute_batch("BEGIN IMMEDIATE;")?;
    // Statements are finalized when the cache drops, before COMMIT/ROLLBACK
    // returns control to the caller.
    let outcome = run_batch(conn, &mut statement_for, rows);
    match outcome {
        Ok(()) => {
            conn.execute_batch("COMMIT;")?;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                log::warn!("rollback after batch error failed: {rollback}");
            }
            Err(e)
        }
    }
}

fn run_batch<F>(conn: &Connection, statement_for: &mut F, rows: &[SqlRow]) -> Result<()>
where
    F: FnMut(&[String]) -> Result<String>,
{
    let mut cache: HashMap<Vec<String>, Statement<'_>> = HashMap::new();

    for row in rows {
        let stmt = match cache.entry(row.signature()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let sql = statement_for(entry.key())?;
                entry.insert(conn.prepare(&sql)?)
            }
        };

        for (position, (column, value)) in row.iter().enumerate() {
            match stmt.parameter_index(&make_named_parameter(column))? {
                Some(index) => stmt.raw_bind_parameter(index, value)?,
                None => stmt.raw_bind_parameter(position + 1, value)?,
            }
        }
        stmt.raw_execute().map_err(map_sqlite_error)?;
    }

    Ok(())
}
