//! Parameterized statement builders
//!
//! Builds INSERT/UPSERT/UPDATE/DELETE text for the data table from a
//! schema, a unique-index spec and the columns present in a row. Columns
//! not present in the schema are silently dropped, so an insert picks up
//! column defaults and an update only touches the supplied fields.

use crate::schema::{escape_identifier, make_named_parameter};
use crate::types::{IndexColumn, Schema};
use crate::{DatabankError, Result, DATA_TABLE};

fn schema_columns<'a>(schema: &Schema, columns: &'a [String]) -> Vec<&'a str> {
    columns
        .iter()
        .filter(|column| schema.contains(column))
        .map(String::as_str)
        .collect()
}

/// Build an INSERT (or upsert) statement for the given row columns.
///
/// With `upsert`, appends `ON CONFLICT(pk...) DO UPDATE SET` over the
/// non-key present columns; a row carrying only key columns degrades to
/// `DO NOTHING`. Fails if no row column matches the schema, or if
/// `upsert` is requested without a unique index.
pub fn insert_statement(
    unique_index: &[IndexColumn],
    schema: &Schema,
    columns: &[String],
    upsert: bool,
) -> Result<String> {
    let valid = schema_columns(schema, columns);
    if valid.is_empty() {
        return Err(DatabankError::Validation(
            "no columns matching the schema were given".into(),
        ));
    }

    let column_list = valid
        .iter()
        .map(|c| escape_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; valid.len()].join(", ");
    let mut sql = format!("INSERT INTO {DATA_TABLE}({column_list}) VALUES({placeholders})");

    if upsert {
        if unique_index.is_empty() {
            return Err(DatabankError::Validation(
                "upsert requested but no uniqueIndex was given".into(),
            ));
        }
        let conflict = unique_index
            .iter()
            .map(|idx| escape_identifier(&idx.column))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = valid
            .iter()
            .filter(|column| !unique_index.iter().any(|idx| idx.column == **column))
            .map(|column| {
                let escaped = escape_identifier(column);
                format!("{escaped}=excluded.{escaped}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT({conflict}) DO NOTHING"));
        } else {
            sql.push_str(&format!(" ON CONFLICT({conflict}) DO UPDATE SET {updates}"));
        }
    }

    sql.push(';');
    Ok(sql)
}

/// Build an UPDATE-by-key statement for the given row columns.
///
/// Every schema-matching column is set via its named parameter; the
/// WHERE clause matches each unique-index column through the same named
/// parameter, so one bound value serves both positions. Fails if a
/// unique-index column is missing from the row or there is nothing to
/// set.
pub fn update_statement(
    unique_index: &[IndexColumn],
    schema: &Schema,
    columns: &[String],
) -> Result<String> {
    let valid = schema_columns(schema, columns);
    if valid.is_empty() {
        return Err(DatabankError::Validation(
            "no columns matching the schema were given".into(),
        ));
    }
    if unique_index.is_empty() {
        return Err(DatabankError::Validation("no uniqueIndex was given".into()));
    }

    let assignments = valid
        .iter()
        .map(|column| {
            format!(
                "{} = {}",
                escape_identifier(column),
                make_named_parameter(column)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut conditions = Vec::with_capacity(unique_index.len());
    for idx in unique_index {
        if !columns.iter().any(|c| *c == idx.column) {
            return Err(DatabankError::Validation(format!(
                "the columns {columns:?} were given for an UPDATE but the unique index \
                 column {} was not specified",
                idx.column
            )));
        }
        conditions.push(format!(
            "{} = {}",
            escape_identifier(&idx.column),
            make_named_parameter(&idx.column)
        ));
    }

    Ok(format!(
        "UPDATE {DATA_TABLE} SET {assignments} WHERE {};",
        conditions.join(" AND ")
    ))
}

/// Build a DELETE-by-key statement for the given row columns.
///
/// Key columns are matched positionally via explicit `?N` parameters,
/// where `N` is the column's 1-based position in the row. Any extra
/// columns present in the row are bound through an always-false
/// disjunct, purely so the positional parameter count stays aligned
/// with the caller's value array.
pub fn delete_statement(unique_index: &[IndexColumn], columns: &[String]) -> Result<String> {
    if unique_index.is_empty() {
        return Err(DatabankError::Validation("no uniqueIndex was given".into()));
    }

    let mut key_conditions = Vec::with_capacity(unique_index.len());
    for idx in unique_index {
        let position = columns
            .iter()
            .position(|c| *c == idx.column)
            .ok_or_else(|| {
                DatabankError::Validation(format!(
                    "the columns {columns:?} were given for a DELETE but the unique index \
                     column {} was not specified",
                    idx.column
                ))
            })?;
        key_conditions.push(format!(
            "{} = ?{}",
            escape_identifier(&idx.column),
            position + 1
        ));
    }

    let extras = columns
        .iter()
        .enumerate()
        .filter(|(_, column)| !unique_index.iter().any(|idx| idx.column == **column))
        .map(|(position, column)| format!("{} = ?{}", escape_identifier(column), position + 1))
        .collect::<Vec<_>>();

    let mut sql = format!(
        "DELETE FROM {DATA_TABLE} WHERE ({})",
        key_conditions.join(" AND ")
    );
    if !extras.is_empty() {
        sql.push_str(&format!(" OR (NULL NOTNULL AND {})", extras.join(" AND ")));
    }
    sql.push(';');
    Ok(sql)
}
