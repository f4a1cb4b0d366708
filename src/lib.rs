//! Databank - embedded dataset store
//!
//! A document-typed schema layer, a filterable/sortable query layer and an
//! out-of-band binary array store, built on top of SQLite and the
//! filesystem. Callers declare a per-field type schema, write rows
//! (including multidimensional typed arrays) matching that schema, and
//! later retrieve, filter, sort, update and delete them. Array payloads
//! are round-tripped byte-for-byte through sidecar files next to the
//! store.
//!
//! The main entry point is [`Database`], opened with [`Database::open`]:
//!
//! ```no_run
//! use databank::{Database, StoreMode, AccessMode, DatasetOptions};
//! use serde_json::json;
//!
//! let mut db = Database::open("sensors.sqlite", StoreMode::File, AccessMode::Create)?;
//! db.create_dataset(&DatasetOptions {
//!     schema: Some(serde_json::from_value(json!({
//!         "dataSchema": {"id": {"__tdxType": ["number", "Int32"]}},
//!         "uniqueIndex": [{"asc": "id"}],
//!     }))?),
//!     ..Default::default()
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod dataset;
pub mod exec;
pub mod filter;
pub mod info;
pub mod ndarray;
pub mod schema;
pub mod statement;
pub mod types;

// Re-export main types
pub use dataset::{AccessMode, Database, DatasetData, DatasetOptions, QueryOptions, StoreMode};
pub use filter::{CmpOp, FilterExpr};
pub use ndarray::{Dtype, NdarrayData, NdarrayMeta};
pub use types::{
    CommandResult, DataRow, DataValue, GeneralType, IndexColumn, Resource, Schema,
    SchemaDefinition, SortDir, SqlRow, SqlValue,
};

use std::path::PathBuf;

/// Name of the table holding dataset rows.
pub(crate) const DATA_TABLE: &str = "data";
/// Name of the key/value metadata table.
pub(crate) const INFO_TABLE: &str = "info";
/// Name of the unique index over the data table.
pub(crate) const DATA_INDEX: &str = "dataindex";
/// Suffix of the sidecar folder holding array blob files.
pub(crate) const FOLDER_SUFFIX: &str = ".d";
/// Blob folder name used for in-memory stores (under the process temp dir).
pub(crate) const TMP_FOLDER_NAME: &str = "databank";
/// Suffix of array blob files.
pub(crate) const DATA_FILE_SUFFIX: &str = ".dat";

/// Maximum page size for queries. An unset or oversized limit is clamped
/// to this value.
pub const MAX_QUERY_LIMIT: u64 = 1000;
/// Bound on parent-directory recursion when creating store paths.
pub(crate) const MAX_PATH_RECURSIONS: u32 = 100;

/// Store error type
#[derive(Debug, thiserror::Error)]
pub enum DatabankError {
    #[error("Schema mismatch: stored {stored}, supplied {supplied}")]
    SchemaMismatch { stored: String, supplied: String },

    #[error("Unique index column not in schema: {0}")]
    UnknownIndexColumn(String),

    #[error("Unique index given but the data schema is empty")]
    IndexWithoutSchema,

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("Byte order mismatch: stored '{stored}', host '{host}'")]
    ByteOrderMismatch { stored: char, host: char },

    #[error("Directory recursion limit reached, there is probably a loop in: {}", .0.display())]
    PathRecursion(PathBuf),

    #[error("{} exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DatabankError>;
