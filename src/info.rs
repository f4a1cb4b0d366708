//! Metadata (info) table management
//!
//! A key/value table holding dataset metadata: id, name, schema, tags,
//! description. Values are stored as JSON text.

use crate::exec::execute_many;
use crate::schema::from_sqlite;
use crate::types::{DataValue, GeneralType, SqlRow, SqlValue};
use crate::{Result, INFO_TABLE};
use rusqlite::Connection;
use serde_json::Value as Json;

/// Create the info table if it does not exist yet.
pub fn create_info_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {INFO_TABLE} (key text PRIMARY KEY, value text);"
    ))?;
    Ok(())
}

/// Store key/value pairs, replacing existing values. Pairs with an empty
/// key are skipped. Returns the number of pairs written.
pub fn set_info_keys(conn: &Connection, pairs: &[(String, Json)]) -> Result<usize> {
    let mut rows = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if key.is_empty() {
            continue;
        }
        rows.push(SqlRow::new(vec![
            ("key".to_string(), SqlValue::Text(key.clone())),
            ("value".to_string(), SqlValue::Text(serde_json::to_string(value)?)),
        ]));
    }

    execute_many(
        conn,
        |_| Ok(format!("REPLACE INTO {INFO_TABLE} (key, value) VALUES(?, ?);")),
        &rows,
    )?;
    Ok(rows.len())
}

/// Fetch the values stored under the given keys.
///
/// Returns immediately with an empty list when no non-empty key is
/// given; no query is issued in that case. Missing keys are simply
/// absent from the result.
pub fn get_info_keys(conn: &Connection, keys: &[&str]) -> Result<Vec<(String, Json)>> {
    let wanted: Vec<&str> = keys.iter().copied().filter(|key| !key.is_empty()).collect();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let clause = vec!["key=?"; wanted.len()].join(" OR ");
    let mut stmt = conn.prepare(&format!(
        "SELECT key, value FROM {INFO_TABLE} WHERE {clause};"
    ))?;
    let mut rows = stmt.query(rusqlite::params_from_iter(wanted.iter()))?;

    let mut pairs = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let decoded = from_sqlite(GeneralType::Object, row.get_ref(1)?)?;
        let value = match decoded {
            DataValue::Json(v) => v,
            DataValue::Null => Json::Null,
            other => other.to_json()?,
        };
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Check whether the info table exists in the store's table catalog.
pub fn check_info_table(conn: &Connection) -> Result<bool> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?;")?;
    let exists = stmt.exists([INFO_TABLE])?;
    Ok(exists)
}
