//! Dataset orchestration
//!
//! Composes the schema converter, statement builder, batch executor,
//! info table and array codec into dataset open/create/read/update/
//! delete operations, translating mongo-style filters, projections and
//! sort specs into parameterized SQL.

use crate::exec::{execute_many, map_sqlite_error};
use crate::filter::FilterExpr;
use crate::info::{check_info_table, create_info_table, get_info_keys, set_info_keys};
use crate::ndarray;
use crate::schema::{convert_row, convert_schema, escape_identifier, from_sqlite, map_schema};
use crate::statement::{delete_statement, insert_statement, update_statement};
use crate::types::{
    CommandOutcome, CommandResult, DataRow, DataValue, GeneralType, Resource, Schema,
    SchemaDefinition, SqlValue,
};
use crate::{
    DatabankError, Result, DATA_FILE_SUFFIX, DATA_INDEX, DATA_TABLE, FOLDER_SUFFIX,
    MAX_PATH_RECURSIONS, MAX_QUERY_LIMIT, TMP_FOLDER_NAME,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};

/// Physical location of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// A file-backed store with a sibling blob folder.
    File,
    /// An in-memory store; blob files go to a process-temp folder.
    Memory,
}

/// Access mode for opening a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Open for read only; fails if the store does not exist.
    ReadOnly,
    /// Open for read and write; fails if the store does not exist.
    ReadWrite,
    /// Open for read and write, creating the store if needed.
    Create,
}

/// Options for [`Database::create_dataset`].
#[derive(Debug, Clone, Default)]
pub struct DatasetOptions {
    /// Requested dataset id; auto-generated if omitted. Ignored when the
    /// dataset already exists (the stored id always wins).
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub parents: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    /// Schema definition; frozen at first creation.
    pub schema: Option<SchemaDefinition>,
}

/// Paging, sorting and metadata options for [`Database::get_data`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Number of rows to skip.
    pub skip: Option<u64>,
    /// Page size; unset, zero or oversized values clamp to
    /// [`MAX_QUERY_LIMIT`].
    pub limit: Option<u64>,
    /// Sort spec: `(field, 1)` ascending, `(field, -1)` descending.
    /// Other values are ignored.
    pub sort: Vec<(String, i32)>,
    /// Embed the dataset resource metadata in the result, saving a
    /// separate [`Database::get_resource`] call.
    pub nqm_meta: bool,
}

/// Result of a [`Database::get_data`] call.
#[derive(Debug, Clone)]
pub struct DatasetData {
    /// Resource metadata, present when requested via
    /// [`QueryOptions::nqm_meta`].
    pub meta_data: Option<Resource>,
    pub data: Vec<DataRow>,
}

/// An open dataset store.
///
/// Owns one SQLite connection, the blob folder path and a private cache
/// of the dataset's general schema. Handles opened against the same
/// physical store never share cache state.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    data_folder: PathBuf,
    schema: Schema,
}

/// Generate a short random id.
fn short_id() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(9)
        .map(char::from)
        .collect()
}

/// Command ids concatenate three short ids for collision headroom.
fn command_id() -> String {
    format!("{}{}{}", short_id(), short_id(), short_id())
}

/// Create a directory and its missing parents, bounded by a recursion
/// budget so a pathological path (e.g. a symlink loop) fails instead of
/// recursing forever.
fn mkdirs(path: &Path, budget: u32) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    if budget == 0 {
        return Err(DatabankError::PathRecursion(path.to_path_buf()));
    }
    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                Ok(())
            } else {
                Err(DatabankError::NotADirectory(path.to_path_buf()))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                mkdirs(parent, budget - 1)?;
            }
            std::fs::create_dir(path)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn clamp_limit(limit: Option<u64>) -> u64 {
    match limit {
        Some(l) if l > 0 && l <= MAX_QUERY_LIMIT => l,
        _ => MAX_QUERY_LIMIT,
    }
}

fn truthy(flag: &Json) -> bool {
    match flag {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl Database {
    /// Open a store, creating it (and its parent directories, up to a
    /// bounded depth) when allowed by `access`. The blob folder is
    /// created next to a file store, or under the process temp
    /// directory for memory stores. Any schema already stored in the
    /// dataset metadata is loaded into this handle's schema cache.
    pub fn open(path: impl AsRef<Path>, mode: StoreMode, access: AccessMode) -> Result<Database> {
        let path = path.as_ref();
        let flags = match access {
            AccessMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            AccessMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
            AccessMode::Create => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };

        let conn = match mode {
            StoreMode::File => {
                if let Some(parent) = path.parent() {
                    mkdirs(parent, MAX_PATH_RECURSIONS)?;
                }
                Connection::open_with_flags(path, flags).map_err(|e| match &e {
                    rusqlite::Error::SqliteFailure(f, _)
                        if f.code == rusqlite::ErrorCode::CannotOpen =>
                    {
                        DatabankError::NotFound(path.display().to_string())
                    }
                    _ => DatabankError::Sqlite(e),
                })?
            }
            StoreMode::Memory => Connection::open_with_flags(":memory:", flags)?,
        };

        let data_folder = match mode {
            StoreMode::File => {
                let folder_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| TMP_FOLDER_NAME.to_string());
                path.parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(format!("{folder_name}{FOLDER_SUFFIX}"))
            }
            StoreMode::Memory => {
                std::env::temp_dir().join(format!("{TMP_FOLDER_NAME}{FOLDER_SUFFIX}"))
            }
        };
        mkdirs(&data_folder, MAX_PATH_RECURSIONS)?;

        let mut schema = Schema::default();
        if check_info_table(&conn)? {
            let stored = get_info_keys(&conn, &["schema"])?;
            if let Some((_, schema_json)) = stored.into_iter().next() {
                let def: SchemaDefinition = serde_json::from_value(schema_json)?;
                schema = convert_schema(&def.data_schema);
            }
        }

        log::debug!(
            "opened store {} ({} schema columns)",
            path.display(),
            schema.len()
        );
        Ok(Database {
            conn,
            data_folder,
            schema,
        })
    }

    /// Close the store, dropping this handle's schema cache.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| DatabankError::Sqlite(e))
    }

    /// The handle's cached general schema.
    pub fn general_schema(&self) -> &Schema {
        &self.schema
    }

    /// The folder holding this dataset's array blob files.
    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    /// Create the dataset, or validate it against an existing one.
    ///
    /// On a fresh store this persists every option field as metadata,
    /// creates the data table from the converted schema, and creates
    /// the unique index when both the schema and the index spec are
    /// non-empty. On a store that already holds a dataset, the supplied
    /// schema must deep-equal the stored schema and the stored id is
    /// returned; the id option is never overwritten.
    pub fn create_dataset(&mut self, options: &DatasetOptions) -> Result<String> {
        let schema_def = options.schema.clone().unwrap_or_default();
        let data_schema_empty = schema_def
            .data_schema
            .as_object()
            .map_or(true, |map| map.is_empty());
        if data_schema_empty && !schema_def.unique_index.is_empty() {
            return Err(DatabankError::IndexWithoutSchema);
        }

        let general = convert_schema(&schema_def.data_schema);
        for idx in &schema_def.unique_index {
            if !general.contains(&idx.column) {
                return Err(DatabankError::UnknownIndexColumn(idx.column.clone()));
            }
        }

        let mut id = options.id.clone().unwrap_or_else(short_id);
        let supplied = serde_json::to_value(&schema_def)?;

        if check_info_table(&self.conn)? {
            let stored = get_info_keys(&self.conn, &["id", "schema"])?;
            let stored_id = stored
                .iter()
                .find(|(key, _)| key == "id")
                .and_then(|(_, value)| value.as_str())
                .unwrap_or_default()
                .to_string();
            let stored_schema = stored
                .into_iter()
                .find(|(key, _)| key == "schema")
                .map(|(_, value)| value)
                .unwrap_or_else(|| Json::Object(Default::default()));

            // Keep the original id
            id = stored_id;
            if stored_schema != supplied {
                return Err(DatabankError::SchemaMismatch {
                    stored: stored_schema.to_string(),
                    supplied: supplied.to_string(),
                });
            }
            self.schema = general;
            return Ok(id);
        }
        self.schema = general;

        create_info_table(&self.conn)?;
        let mut pairs: Vec<(String, Json)> = vec![
            ("id".to_string(), Json::String(id.clone())),
            ("schema".to_string(), supplied),
        ];
        if let Some(name) = &options.name {
            pairs.push(("name".to_string(), Json::String(name.clone())));
        }
        if let Some(description) = &options.description {
            pairs.push(("description".to_string(), Json::String(description.clone())));
        }
        if let Some(parents) = &options.parents {
            pairs.push(("parents".to_string(), serde_json::to_value(parents)?));
        }
        if let Some(tags) = &options.tags {
            pairs.push(("tags".to_string(), serde_json::to_value(tags)?));
        }
        set_info_keys(&self.conn, &pairs)?;

        if !self.schema.is_empty() {
            let columns = map_schema(&self.schema)
                .iter()
                .map(|(column, column_type)| {
                    format!("{} {column_type}", escape_identifier(column))
                })
                .collect::<Vec<_>>()
                .join(",");
            self.conn
                .execute_batch(&format!("CREATE TABLE {DATA_TABLE}({columns});"))?;

            if !schema_def.unique_index.is_empty() {
                let key = schema_def
                    .unique_index
                    .iter()
                    .map(|idx| {
                        format!("{} {}", escape_identifier(&idx.column), idx.direction.as_sql())
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                self.conn.execute_batch(&format!(
                    "CREATE UNIQUE INDEX {DATA_INDEX} ON {DATA_TABLE}({key});"
                ))?;
            }
        }

        log::info!("created dataset {id} with {} columns", self.schema.len());
        Ok(id)
    }

    /// The unique index stored with the dataset schema.
    fn dataset_unique_index(&self) -> Result<Vec<crate::types::IndexColumn>> {
        let stored = get_info_keys(&self.conn, &["schema"])?;
        match stored.into_iter().next() {
            Some((_, schema_json)) => {
                let def: SchemaDefinition = serde_json::from_value(schema_json)?;
                Ok(def.unique_index)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Insert rows as one atomic batch. Array-valued columns are
    /// extracted to blob files first. Returns the inserted count;
    /// duplicate unique-index values fail the whole batch, and the
    /// blob files extracted for it are removed again.
    pub fn add_data(&mut self, data: &[DataRow]) -> Result<usize> {
        let mut rows = data.to_vec();
        let array_columns = self.schema.columns_of(GeneralType::Ndarray);
        let written = if array_columns.is_empty() {
            Vec::new()
        } else {
            ndarray::write_many(&self.data_folder, &mut rows, &array_columns)?
        };

        match self.insert_rows(&rows) {
            Ok(count) => Ok(count),
            Err(e) => {
                ndarray::remove_files(&written);
                Err(e)
            }
        }
    }

    fn insert_rows(&self, rows: &[DataRow]) -> Result<usize> {
        let sql_rows = rows
            .iter()
            .map(|row| convert_row(&self.schema, row))
            .collect::<Result<Vec<_>>>()?;
        let unique_index = self.dataset_unique_index()?;
        let schema = &self.schema;

        execute_many(
            &self.conn,
            |columns| insert_statement(&unique_index, schema, columns, false),
            &sql_rows,
        )?;
        log::debug!("inserted {} rows", sql_rows.len());
        Ok(sql_rows.len())
    }

    /// Column selection from a mongo-style projection: the inclusion
    /// list wins when any field is truthy, otherwise exclusions are
    /// subtracted from the schema columns.
    fn select_columns(&self, projection: Option<&Json>) -> Vec<String> {
        let mut included: Vec<String> = Vec::new();
        let mut excluded: Vec<String> = self.schema.columns();
        if let Some(Json::Object(map)) = projection {
            for (field, flag) in map {
                if !self.schema.contains(field) {
                    continue;
                }
                if truthy(flag) {
                    included.push(field.clone());
                } else {
                    excluded.retain(|column| column != field);
                }
            }
        }
        if included.is_empty() {
            excluded
        } else {
            included
        }
    }

    fn build_select(
        &self,
        distinct: bool,
        columns: &[String],
        filter: Option<&Json>,
        options: &QueryOptions,
    ) -> Result<(String, Vec<SqlValue>)> {
        let column_list = columns
            .iter()
            .map(|column| escape_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {}{column_list} FROM {DATA_TABLE}",
            if distinct { "DISTINCT " } else { "" }
        );

        let expr = FilterExpr::parse(filter.unwrap_or(&Json::Null))?;
        let mut params = Vec::new();
        if let Some((clause, bound)) = expr.where_clause() {
            sql.push_str(&format!(" WHERE {clause}"));
            params = bound;
        }

        let order: Vec<String> = options
            .sort
            .iter()
            .filter_map(|(field, direction)| match direction {
                1 => Some(format!("{} ASC", escape_identifier(field))),
                -1 => Some(format!("{} DESC", escape_identifier(field))),
                _ => None,
            })
            .collect();
        if !order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }

        sql.push_str(&format!(" LIMIT {}", clamp_limit(options.limit)));
        if let Some(skip) = options.skip {
            if skip > 0 {
                sql.push_str(&format!(" OFFSET {skip}"));
            }
        }
        sql.push(';');
        Ok((sql, params))
    }

    fn query_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
        columns: &[String],
    ) -> Result<Vec<DataRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut decoded = DataRow::new();
            for (i, column) in columns.iter().enumerate() {
                let ty = self.schema.get(column).unwrap_or(GeneralType::Text);
                decoded.set(column.clone(), from_sqlite(ty, row.get_ref(i)?)?);
            }
            out.push(decoded);
        }
        Ok(out)
    }

    /// Retrieve rows matching `filter`, shaped by `projection` and
    /// paged/sorted per `options`. OBJECT/ARRAY columns are decoded
    /// from JSON and NDARRAY columns are resolved from their blob
    /// files.
    pub fn get_data(
        &self,
        filter: Option<&Json>,
        projection: Option<&Json>,
        options: &QueryOptions,
    ) -> Result<DatasetData> {
        let meta_data = if options.nqm_meta {
            Some(self.get_resource()?)
        } else {
            None
        };

        let columns = self.select_columns(projection);
        if columns.is_empty() {
            return Ok(DatasetData {
                meta_data,
                data: Vec::new(),
            });
        }

        let (sql, params) = self.build_select(false, &columns, filter, options)?;
        let mut data = self.query_rows(&sql, &params, &columns)?;

        let array_columns: Vec<String> = self
            .schema
            .columns_of(GeneralType::Ndarray)
            .into_iter()
            .filter(|column| columns.contains(column))
            .collect();
        if !array_columns.is_empty() {
            ndarray::read_many(&self.data_folder, &mut data, &array_columns)?;
        }

        Ok(DatasetData { meta_data, data })
    }

    /// Distinct values of one field under an optional filter. Returns
    /// an empty list for a blank or unknown field, and for array-typed
    /// fields.
    pub fn get_distinct(&self, field: &str, filter: Option<&Json>) -> Result<Vec<Json>> {
        if field.is_empty() || !self.schema.contains(field) {
            return Ok(Vec::new());
        }
        if self.schema.get(field) == Some(GeneralType::Ndarray) {
            return Ok(Vec::new());
        }

        let columns = vec![field.to_string()];
        let (sql, params) =
            self.build_select(true, &columns, filter, &QueryOptions::default())?;
        let rows = self.query_rows(&sql, &params, &columns)?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let value = row.get(field).unwrap_or(&DataValue::Null);
            values.push(value.to_json()?);
        }
        Ok(values)
    }

    /// Update rows by key, or upsert them, as one atomic batch.
    ///
    /// With `throws` unset, a batch error is captured in the returned
    /// [`CommandResult`] instead of propagating; there is no per-row
    /// error granularity.
    pub fn update_data(
        &mut self,
        data: &[DataRow],
        upsert: bool,
        throws: bool,
    ) -> Result<CommandResult> {
        let sql_rows = data
            .iter()
            .map(|row| convert_row(&self.schema, row))
            .collect::<Result<Vec<_>>>()?;
        let unique_index = self.dataset_unique_index()?;
        let schema = &self.schema;

        let outcome = execute_many(
            &self.conn,
            |columns| {
                if upsert {
                    insert_statement(&unique_index, schema, columns, true)
                } else {
                    update_statement(&unique_index, schema, columns)
                }
            },
            &sql_rows,
        );

        let mut result = CommandResult {
            command_id: command_id(),
            response: None,
            result: CommandOutcome::default(),
        };
        match outcome {
            Ok(()) => {
                result.response = Some("Success".to_string());
                Ok(result)
            }
            Err(e) if !throws => {
                result.result.errors.push(e.to_string());
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    /// Update every row matching `filter` with the fields of `patch`,
    /// returning how many rows matched beforehand. An empty patch
    /// short-circuits to zero without touching the store.
    pub fn update_data_by_query(
        &mut self,
        filter: Option<&Json>,
        patch: &DataRow,
    ) -> Result<u64> {
        let sql_patch = convert_row(&self.schema, patch)?;
        if sql_patch.is_empty() {
            return Ok(0);
        }

        let expr = FilterExpr::parse(filter.unwrap_or(&Json::Null))?;
        let (where_sql, where_params) = match expr.where_clause() {
            Some((clause, params)) => (format!(" WHERE {clause}"), params),
            None => (String::new(), Vec::new()),
        };

        let count: i64 = self.conn.query_row(
            &format!("SELECT Count(*) AS count FROM {DATA_TABLE}{where_sql};"),
            rusqlite::params_from_iter(where_params.iter()),
            |row| row.get(0),
        )?;

        let assignments = sql_patch
            .iter()
            .map(|(column, _)| format!("{} = ?", escape_identifier(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let params: Vec<SqlValue> = sql_patch
            .iter()
            .map(|(_, value)| value.clone())
            .chain(where_params)
            .collect();
        self.conn
            .execute(
                &format!("UPDATE {DATA_TABLE} SET {assignments}{where_sql};"),
                rusqlite::params_from_iter(params.iter()),
            )
            .map_err(map_sqlite_error)?;

        Ok(count as u64)
    }

    /// Delete rows by exact unique-index match, one atomic batch.
    /// Fails on a dataset without a unique index; use
    /// [`Database::update_data_by_query`]-style filters to address rows
    /// in that case.
    pub fn delete_data(&mut self, data: &[DataRow]) -> Result<()> {
        let unique_index = self.dataset_unique_index()?;
        if unique_index.is_empty() {
            return Err(DatabankError::Validation(
                "cannot delete by key on a dataset with no uniqueIndex; delete by query instead"
                    .into(),
            ));
        }

        let sql_rows = data
            .iter()
            .map(|row| convert_row(&self.schema, row))
            .collect::<Result<Vec<_>>>()?;
        execute_many(
            &self.conn,
            |columns| delete_statement(&unique_index, columns),
            &sql_rows,
        )
    }

    /// Delete all rows, reclaim storage and remove every blob file (the
    /// folder itself persists). Returns the prior row count.
    pub fn truncate_resource(&mut self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT Count(*) AS count FROM {DATA_TABLE};"), [], |row| {
                    row.get(0)
                })?;
        self.conn
            .execute_batch(&format!("DELETE FROM {DATA_TABLE}; VACUUM;"))?;

        for entry in std::fs::read_dir(&self.data_folder)? {
            let path = entry?.path();
            let is_blob = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.ends_with(DATA_FILE_SUFFIX));
            if is_blob {
                std::fs::remove_file(&path)?;
            }
        }

        log::debug!("truncated dataset, removed {count} rows");
        Ok(count as u64)
    }

    /// Project the dataset metadata into the external [`Resource`]
    /// shape, with `null` defaults for unset fields. Fails when no
    /// dataset metadata exists in this store.
    pub fn get_resource(&self) -> Result<Resource> {
        if !check_info_table(&self.conn)? {
            return Err(DatabankError::NotFound(
                "no dataset metadata in this store".into(),
            ));
        }

        let pairs = get_info_keys(
            &self.conn,
            &["description", "id", "name", "parents", "tags", "schema"],
        )?;
        let mut resource = Resource::default();
        for (key, value) in pairs {
            match key.as_str() {
                "description" => resource.description = value.as_str().map(String::from),
                "id" => resource.id = value.as_str().map(String::from),
                "name" => resource.name = value.as_str().map(String::from),
                "parents" => resource.parents = Some(value),
                "tags" => resource.tags = Some(value),
                "schema" => resource.schema_definition = Some(value),
                _ => {}
            }
        }
        Ok(resource)
    }

    /// Count the rows matching `filter`.
    pub fn get_dataset_data_count(&self, filter: Option<&Json>) -> Result<u64> {
        let expr = FilterExpr::parse(filter.unwrap_or(&Json::Null))?;
        let (where_sql, params) = match expr.where_clause() {
            Some((clause, params)) => (format!(" WHERE {clause}"), params),
            None => (String::new(), Vec::new()),
        };
        let count: i64 = self.conn.query_row(
            &format!("SELECT Count(*) AS count FROM {DATA_TABLE}{where_sql};"),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
