//! Query filter translation
//!
//! A bounded mongo-style comparison/boolean subset parsed into an
//! explicit AST, then compiled in one pass to a parameterized SQL WHERE
//! clause. Field names are escaped as identifiers and every comparison
//! value is bound, never interpolated.

use crate::schema::escape_identifier;
use crate::types::SqlValue;
use crate::{DatabankError, Result};
use serde_json::Value as Json;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }

    fn from_key(key: &str) -> Option<CmpOp> {
        match key {
            "$gt" => Some(CmpOp::Gt),
            "$gte" => Some(CmpOp::Gte),
            "$lt" => Some(CmpOp::Lt),
            "$lte" => Some(CmpOp::Lte),
            _ => None,
        }
    }
}

/// A filter expression over dataset rows.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Matches every row.
    All,
    /// Compare a field to a scalar value.
    Cmp {
        field: String,
        op: CmpOp,
        value: SqlValue,
    },
    /// Field holds NULL. SQL equality never matches NULL, so `{field:
    /// null}` compiles to `IS NULL` instead.
    IsNull { field: String },
    /// AND combination
    And(Vec<FilterExpr>),
    /// OR combination
    Or(Vec<FilterExpr>),
}

fn scalar_param(value: &Json) -> Result<SqlValue> {
    match value {
        Json::Null => Err(DatabankError::Validation(
            "null cannot be a comparison operand; match it with {field: null}".into(),
        )),
        Json::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else {
                Ok(SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Json::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(DatabankError::Validation(format!(
            "filter comparison values must be scalars, got {other}"
        ))),
    }
}

impl FilterExpr {
    /// Parse a mongo-style filter document.
    ///
    /// Accepts `{field: value}` equality (`{field: null}` matches NULL
    /// cells), `{field: {$gt: value, ...}}` comparisons, and
    /// `$and`/`$or` arrays, nested to arbitrary depth. A missing or
    /// empty filter matches everything.
    pub fn parse(filter: &Json) -> Result<FilterExpr> {
        let map = match filter {
            Json::Null => return Ok(FilterExpr::All),
            Json::Object(map) => map,
            other => {
                return Err(DatabankError::Validation(format!(
                    "filter must be a JSON object, got {other}"
                )))
            }
        };
        if map.is_empty() {
            return Ok(FilterExpr::All);
        }

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$and" | "$or" => {
                    let parts = value.as_array().ok_or_else(|| {
                        DatabankError::Validation(format!("{key} expects an array, got {value}"))
                    })?;
                    let sub = parts
                        .iter()
                        .map(FilterExpr::parse)
                        .collect::<Result<Vec<_>>>()?;
                    clauses.push(if key == "$and" {
                        FilterExpr::And(sub)
                    } else {
                        FilterExpr::Or(sub)
                    });
                }
                field => clauses.push(Self::parse_field(field, value)?),
            }
        }

        Ok(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            FilterExpr::And(clauses)
        })
    }

    fn parse_field(field: &str, value: &Json) -> Result<FilterExpr> {
        if value.is_null() {
            return Ok(FilterExpr::IsNull {
                field: field.to_string(),
            });
        }
        if let Json::Object(ops) = value {
            let mut cmps = Vec::with_capacity(ops.len());
            for (key, operand) in ops {
                let op = CmpOp::from_key(key).ok_or_else(|| {
                    DatabankError::Validation(format!(
                        "unsupported filter operator {key} on field {field}"
                    ))
                })?;
                cmps.push(FilterExpr::Cmp {
                    field: field.to_string(),
                    op,
                    value: scalar_param(operand)?,
                });
            }
            return Ok(if cmps.len() == 1 {
                cmps.remove(0)
            } else {
                FilterExpr::And(cmps)
            });
        }

        Ok(FilterExpr::Cmp {
            field: field.to_string(),
            op: CmpOp::Eq,
            value: scalar_param(value)?,
        })
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FilterExpr::All)
    }

    /// Compile to a WHERE clause body and its bound parameters.
    ///
    /// Returns `None` when the filter matches everything and no WHERE
    /// clause should be emitted.
    pub fn where_clause(&self) -> Option<(String, Vec<SqlValue>)> {
        let mut params = Vec::new();
        let sql = self.compile(&mut params)?;
        Some((sql, params))
    }

    fn compile(&self, params: &mut Vec<SqlValue>) -> Option<String> {
        match self {
            FilterExpr::All => None,
            FilterExpr::Cmp { field, op, value } => {
                params.push(value.clone());
                Some(format!("{} {} ?", escape_identifier(field), op.as_sql()))
            }
            FilterExpr::IsNull { field } => {
                Some(format!("{} IS NULL", escape_identifier(field)))
            }
            FilterExpr::And(parts) => Self::combine(parts, " AND ", params),
            FilterExpr::Or(parts) => Self::combine(parts, " OR ", params),
        }
    }

    fn combine(parts: &[FilterExpr], joiner: &str, params: &mut Vec<SqlValue>) -> Option<String> {
        let compiled: Vec<String> = parts
            .iter()
            .filter_map(|part| part.compile(params))
            .collect();
        match compiled.len() {
            0 => None,
            1 => Some(compiled.into_iter().next().unwrap_or_default()),
            _ => Some(format!("({})", compiled.join(joiner))),
        }
    }
}
