//! Document schema to SQLite schema conversion
//!
//! Maps nested document-type declarations to [`GeneralType`]s, converts
//! values between their document and storage representations, and
//! produces injection-safe identifiers and bind-parameter tokens.

use crate::types::{DataValue, GeneralType, Schema, SqlRow, SqlValue};
use crate::{DatabankError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use serde_json::Value as Json;

/// Key marking a nested schema object as a type descriptor.
pub const TYPE_NAME_KEY: &str = "__tdxType";

/// Matches the derived-type qualifiers that map to a REAL column.
static REAL_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new("REAL|FLOA|DOUB").expect("valid regex"));

/// Resolve a basic general type from a type-qualifier list.
///
/// The first qualifier selects the base type (case-insensitive); for
/// `"number"` the second qualifier picks between INTEGER, REAL and
/// NUMERIC. Unrecognized base types fall back to TEXT.
pub fn basic_type(qualifiers: &[Json]) -> GeneralType {
    let base = qualifiers
        .first()
        .and_then(Json::as_str)
        .unwrap_or("")
        .to_lowercase();
    let derived = qualifiers
        .get(1)
        .and_then(Json::as_str)
        .unwrap_or("")
        .to_uppercase();

    match base.as_str() {
        "string" => GeneralType::Text,
        "boolean" | "date" => GeneralType::Numeric,
        "ndarray" => GeneralType::Ndarray,
        "number" => {
            if derived.contains("INT") {
                GeneralType::Integer
            } else if REAL_TYPE_RE.is_match(&derived) {
                GeneralType::Real
            } else {
                GeneralType::Numeric
            }
        }
        _ => GeneralType::Text,
    }
}

/// Convert a nested document schema into a [`Schema`].
///
/// Array literals become ARRAY columns, objects carrying the
/// [`TYPE_NAME_KEY`] marker resolve through [`basic_type`], and plain
/// objects become OBJECT columns. Scalar entries are skipped.
pub fn convert_schema(data_schema: &Json) -> Schema {
    let mut fields = Vec::new();
    if let Json::Object(map) = data_schema {
        for (column, descriptor) in map {
            let ty = match descriptor {
                Json::Array(_) => GeneralType::Array,
                Json::Object(obj) => match obj.get(TYPE_NAME_KEY) {
                    Some(Json::Array(qualifiers)) => basic_type(qualifiers),
                    Some(_) => basic_type(&[]),
                    None => GeneralType::Object,
                },
                _ => continue,
            };
            fields.push((column.clone(), ty));
        }
    }
    Schema::new(fields)
}

/// Map a general schema to physical column types for CREATE TABLE.
pub fn map_schema(schema: &Schema) -> Vec<(String, &'static str)> {
    schema
        .iter()
        .map(|(column, ty)| (column.to_string(), ty.column_type()))
        .collect()
}

/// Escape an SQLite identifier, e.g. a column name.
///
/// Double-quotes the identifier and doubles embedded quotes, so column
/// names can never be misread as string literals or injected SQL.
pub fn escape_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Build a named bind-parameter token for a column name.
///
/// SQLite's `:a(...)` parameter syntax rejects whitespace, `)` and the
/// `%` escape char inside the parentheses, so those are percent-hex
/// encoded. The mapping from column name to token is 1-to-1.
pub fn make_named_parameter(column: &str) -> String {
    let mut escaped = String::with_capacity(column.len());
    for c in column.chars() {
        match c {
            '%' | '\x09' | '\x0a' | '\x0c' | '\x0d' | ' ' | ')' => {
                escaped.push_str(&format!("%{:x}", c as u32));
            }
            _ => escaped.push(c),
        }
    }
    format!(":a({escaped})")
}

/// Escape a text value as a single-quoted SQL string literal.
fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Convert a document value to its storage representation.
///
/// With `literal` set, text-valued results are returned quote-escaped
/// for direct embedding in SQL; bound parameters never need this.
pub fn to_sqlite(ty: Option<GeneralType>, value: &DataValue, literal: bool) -> Result<SqlValue> {
    let ty = match ty {
        Some(ty) => ty,
        // Column unknown to the schema: no storage representation.
        None => return Ok(SqlValue::Null),
    };
    match ty {
        GeneralType::Object | GeneralType::Array | GeneralType::Ndarray => {
            let text = serde_json::to_string(&value.to_json()?)?;
            Ok(SqlValue::Text(if literal { quote_literal(&text) } else { text }))
        }
        GeneralType::Integer | GeneralType::Real | GeneralType::Numeric => Ok(match value {
            DataValue::Null => SqlValue::Null,
            DataValue::Bool(b) => SqlValue::Integer(*b as i64),
            DataValue::Int(i) => SqlValue::Integer(*i),
            DataValue::Float(f) => SqlValue::Real(*f),
            DataValue::Text(s) => SqlValue::Text(s.clone()),
            other => {
                return Err(DatabankError::Validation(format!(
                    "cannot store {other:?} in a {} column",
                    ty.column_type()
                )))
            }
        }),
        GeneralType::Text => match value {
            DataValue::Null => Ok(SqlValue::Null),
            DataValue::Text(s) => Ok(SqlValue::Text(if literal {
                quote_literal(s)
            } else {
                s.clone()
            })),
            DataValue::Int(i) => Ok(SqlValue::Integer(*i)),
            DataValue::Float(f) => Ok(SqlValue::Real(*f)),
            other => Err(DatabankError::Validation(format!(
                "cannot store {other:?} in a TEXT column"
            ))),
        },
    }
}

/// Convert a stored SQLite value back to its document representation.
pub fn from_sqlite(ty: GeneralType, value: ValueRef<'_>) -> Result<DataValue> {
    match ty {
        GeneralType::Object | GeneralType::Array | GeneralType::Ndarray => match value {
            ValueRef::Null => Ok(DataValue::Null),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    DatabankError::Validation(format!("stored JSON is not UTF-8: {e}"))
                })?;
                Ok(DataValue::Json(serde_json::from_str(text)?))
            }
            other => Err(DatabankError::Validation(format!(
                "expected JSON text cell, got {other:?}"
            ))),
        },
        GeneralType::Integer | GeneralType::Real | GeneralType::Numeric | GeneralType::Text => {
            Ok(match value {
                ValueRef::Null => DataValue::Null,
                ValueRef::Integer(i) => DataValue::Int(i),
                ValueRef::Real(f) => DataValue::Float(f),
                ValueRef::Text(bytes) => DataValue::Text(String::from_utf8_lossy(bytes).into()),
                ValueRef::Blob(_) => {
                    return Err(DatabankError::Validation(
                        "unexpected blob cell in scalar column".into(),
                    ))
                }
            })
        }
    }
}

/// Convert a document row to a storage row.
///
/// Columns unknown to the schema are silently dropped: writes only ever
/// touch schema-declared columns, so the statement builder and the
/// bound value array always stay aligned.
pub fn convert_row(schema: &Schema, row: &crate::types::DataRow) -> Result<SqlRow> {
    let mut columns = Vec::with_capacity(row.len());
    for (column, value) in row.iter() {
        match schema.get(column) {
            Some(ty) => columns.push((column.to_string(), to_sqlite(Some(ty), value, false)?)),
            None => log::debug!("dropping column {column} not present in the schema"),
        }
    }
    Ok(SqlRow::new(columns))
}
