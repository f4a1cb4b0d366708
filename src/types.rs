//! Core value and row types

use crate::ndarray::NdarrayData;
use crate::{DatabankError, Result};
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::ToSql;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;

/// General storage type of a schema field.
///
/// `Object`, `Array` and `Ndarray` keep their identity for value
/// (de)serialization but collapse to a TEXT column in the physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneralType {
    Integer,
    Real,
    Numeric,
    Text,
    Object,
    Array,
    Ndarray,
}

impl GeneralType {
    /// The physical SQLite column type for this general type.
    pub fn column_type(self) -> &'static str {
        match self {
            GeneralType::Integer => "INTEGER",
            GeneralType::Real => "REAL",
            GeneralType::Numeric => "NUMERIC",
            GeneralType::Text | GeneralType::Object | GeneralType::Array | GeneralType::Ndarray => {
                "TEXT"
            }
        }
    }

    /// True for types stored as JSON text (`Object`, `Array`, `Ndarray`).
    pub fn is_complex(self) -> bool {
        matches!(
            self,
            GeneralType::Object | GeneralType::Array | GeneralType::Ndarray
        )
    }
}

/// A dataset schema: ordered mapping of column name to general type.
///
/// Field order follows the document schema declaration and fixes the
/// column order of the data table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<(String, GeneralType)>,
}

impl Schema {
    pub fn new(fields: Vec<(String, GeneralType)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<GeneralType> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, ty)| *ty)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, GeneralType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Columns of a given general type, in schema order.
    pub fn columns_of(&self, ty: GeneralType) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, t)| *t == ty)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn has_complex(&self) -> bool {
        self.fields.iter().any(|(_, ty)| ty.is_complex())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A document-side value.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// An object or array, kept as JSON.
    Json(Json),
    /// A raw typed array. Only valid on write paths that extract arrays
    /// to blob files; reads return this variant with the file contents.
    Ndarray(NdarrayData),
}

impl DataValue {
    /// Build a value from a JSON scalar or compound.
    pub fn from_json(value: Json) -> DataValue {
        match value {
            Json::Null => DataValue::Null,
            Json::Bool(b) => DataValue::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DataValue::Int(i)
                } else {
                    DataValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => DataValue::Text(s),
            other => DataValue::Json(other),
        }
    }

    /// JSON representation of this value.
    ///
    /// Raw ndarrays have no JSON form; they must be extracted to blob
    /// files (and replaced by their descriptors) before conversion.
    pub fn to_json(&self) -> Result<Json> {
        match self {
            DataValue::Null => Ok(Json::Null),
            DataValue::Bool(b) => Ok(Json::Bool(*b)),
            DataValue::Int(i) => Ok(Json::from(*i)),
            DataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| {
                    DatabankError::Validation(format!("non-finite number {f} has no JSON form"))
                }),
            DataValue::Text(s) => Ok(Json::String(s.clone())),
            DataValue::Json(v) => Ok(v.clone()),
            DataValue::Ndarray(_) => Err(DatabankError::Validation(
                "raw ndarray values must be extracted to files before serialization".into(),
            )),
        }
    }
}

/// A document row: ordered association of column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataRow {
    columns: Vec<(String, DataValue)>,
}

impl DataRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value, replacing any previous value for that column.
    pub fn set(&mut self, column: impl Into<String>, value: DataValue) -> &mut Self {
        let column = column.into();
        if let Some(slot) = self.columns.iter_mut().find(|(name, _)| *name == column) {
            slot.1 = value;
        } else {
            self.columns.push((column, value));
        }
        self
    }

    pub fn get(&self, column: &str) -> Option<&DataValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, column: &str) -> Option<&mut DataValue> {
        self.columns
            .iter_mut()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Remove and return a column value.
    pub fn take(&mut self, column: &str) -> Option<DataValue> {
        let idx = self.columns.iter().position(|(name, _)| name == column)?;
        Some(self.columns.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Build a row from a JSON object, preserving field order.
    pub fn from_json(value: &Json) -> Result<DataRow> {
        let map = value.as_object().ok_or_else(|| {
            DatabankError::Validation(format!("expected a JSON object row, got {value}"))
        })?;
        let mut row = DataRow::new();
        for (column, v) in map {
            row.set(column.clone(), DataValue::from_json(v.clone()));
        }
        Ok(row)
    }

    /// JSON object representation, preserving column order.
    pub fn to_json(&self) -> Result<Json> {
        let mut map = serde_json::Map::new();
        for (column, value) in &self.columns {
            map.insert(column.clone(), value.to_json()?);
        }
        Ok(Json::Object(map))
    }
}

/// A storage-side value, directly bindable to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// A storage-side row with normalized column order.
///
/// Columns are sorted by name at construction so that two rows carrying
/// the same columns in a different order produce the same column
/// signature and share one compiled statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new(mut columns: Vec<(String, SqlValue)>) -> Self {
        columns.sort_by(|a, b| a.0.cmp(&b.0));
        Self { columns }
    }

    /// The ordered column-name sequence identifying this row's shape.
    pub fn signature(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Sort direction of a unique-index column or an ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }

    fn as_key(self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }
}

/// One column of a unique index.
///
/// Serializes to the single-entry map form used in stored schema
/// definitions: `{"asc": "column"}` or `{"desc": "column"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub direction: SortDir,
    pub column: String,
}

impl IndexColumn {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            direction: SortDir::Asc,
            column: column.into(),
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            direction: SortDir::Desc,
            column: column.into(),
        }
    }
}

impl Serialize for IndexColumn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.direction.as_key(), &self.column)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for IndexColumn {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct IndexColumnVisitor;

        impl<'de> Visitor<'de> for IndexColumnVisitor {
            type Value = IndexColumn;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-entry map like {\"asc\": \"column\"}")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<IndexColumn, A::Error> {
                let (order, column): (String, String) = access
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("unique index entry must have one key"))?;
                if access.next_entry::<String, String>()?.is_some() {
                    return Err(de::Error::custom(
                        "unique index entry must have exactly one key",
                    ));
                }
                let direction = match order.as_str() {
                    "asc" => SortDir::Asc,
                    "desc" => SortDir::Desc,
                    other => {
                        return Err(de::Error::custom(format!(
                            "unique index sort order must be asc or desc, got {other}"
                        )))
                    }
                };
                Ok(IndexColumn { direction, column })
            }
        }

        deserializer.deserialize_map(IndexColumnVisitor)
    }
}

/// A dataset schema definition: the nested document schema plus the
/// unique-index column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(rename = "dataSchema", default = "empty_object")]
    pub data_schema: Json,
    #[serde(rename = "uniqueIndex", default)]
    pub unique_index: Vec<IndexColumn>,
}

impl Default for SchemaDefinition {
    fn default() -> Self {
        Self {
            data_schema: empty_object(),
            unique_index: Vec::new(),
        }
    }
}

fn empty_object() -> Json {
    Json::Object(serde_json::Map::new())
}

/// Command status envelope returned by non-throwing mutation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "commandId")]
    pub command_id: String,
    pub response: Option<String>,
    pub result: CommandOutcome,
}

/// Detailed per-command error information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub errors: Vec<String>,
    pub commit: Vec<Json>,
}

/// External dataset metadata shape, projected from the info table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub parents: Option<Json>,
    pub tags: Option<Json>,
    #[serde(rename = "schemaDefinition")]
    pub schema_definition: Option<Json>,
}
