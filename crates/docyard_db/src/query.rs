//! Translation of document predicates into SQLite filters.
//!
//! The store only consumes [`SqlFilter`]s; anything that can produce one
//! implements [`NativeFilter`]. [`DocumentQuery`] is the builder used by
//! pipeline stages.
//!
//! Field paths are embedded into the SQL text (not bound) so that the
//! expression indexes on claim tags can be used by the planner. Names that
//! contain quote characters are therefore rejected.

use crate::error::{DbError, Result};
use crate::types::{FETCHED_METADATA_TAG, TOUCHED_METADATA_TAG};
use docyard_ids::DocumentId;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

/// Something that can be expressed as a filter over stored documents.
pub trait NativeFilter {
    fn to_native_filter(&self) -> Result<SqlFilter>;
}

/// A bound value of a [`SqlFilter`]
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&Value> for FilterValue {
    /// Map a JSON value onto what `json_extract` yields for it.
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        Self::from(&value)
    }
}

/// SQL boolean expression over the `id`, `contents`, `metadata` and `action`
/// columns, with positional binds.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    clause: String,
    binds: Vec<FilterValue>,
    order_by: Option<String>,
}

impl SqlFilter {
    pub fn new(clause: impl Into<String>, binds: Vec<FilterValue>) -> Self {
        Self {
            clause: clause.into(),
            binds,
            order_by: None,
        }
    }

    pub fn match_all() -> Self {
        Self::new("1 = 1", Vec::new())
    }

    /// Conjunction of both filters. Keeps this filter's ordering, or takes
    /// the other one's if this has none.
    pub fn and(mut self, other: SqlFilter) -> Self {
        self.clause = format!("({}) AND ({})", self.clause, other.clause);
        self.binds.extend(other.binds);
        if self.order_by.is_none() {
            self.order_by = other.order_by;
        }
        self
    }

    /// Replace natural order with `expression` (e.g. `json_extract(...) DESC`).
    pub fn with_order(mut self, expression: impl Into<String>) -> Self {
        self.order_by = Some(expression.into());
        self
    }

    pub fn clause(&self) -> &str {
        &self.clause
    }

    pub fn binds(&self) -> &[FilterValue] {
        &self.binds
    }

    /// `ORDER BY` expression, falling back to insertion order.
    pub fn order_by(&self) -> &str {
        self.order_by.as_deref().unwrap_or("seq ASC")
    }

    pub(crate) fn bind_to<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        bind_values(query, &self.binds)
    }
}

impl NativeFilter for SqlFilter {
    fn to_native_filter(&self) -> Result<SqlFilter> {
        Ok(self.clone())
    }
}

pub(crate) fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &[FilterValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            FilterValue::Null => query.bind(None::<String>),
            // json_extract reports JSON booleans as 1 / 0
            FilterValue::Bool(b) => query.bind(i64::from(*b)),
            FilterValue::Integer(i) => query.bind(*i),
            FilterValue::Real(r) => query.bind(*r),
            FilterValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

// ============================================================================
// JSON paths
// ============================================================================

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(DbError::invalid_input("Empty field name"));
    }
    if segment
        .chars()
        .any(|ch| ch == '"' || ch == '\'' || ch.is_control())
    {
        return Err(DbError::invalid_input(format!(
            "Field name {:?} contains quote or control characters",
            segment
        )));
    }
    Ok(())
}

/// SQLite JSON path addressing `segments` as nested object keys.
pub(crate) fn json_path<S: AsRef<str>>(segments: &[S]) -> Result<String> {
    let mut path = String::from("$");
    for segment in segments {
        let segment = segment.as_ref();
        validate_segment(segment)?;
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    Ok(path)
}

/// Path of a dotted metadata name such as `fetched.parse`.
pub(crate) fn metadata_path(name: &str) -> Result<String> {
    let segments: Vec<&str> = name.split('.').collect();
    json_path(&segments)
}

/// Path of a content field; dots are part of the name.
pub(crate) fn content_path(name: &str) -> Result<String> {
    json_path(&[name])
}

/// `json_type(metadata, '$."fetched"."<tag>"')`, also used as index expression.
pub(crate) fn fetched_tag_expression(tag: &str) -> Result<String> {
    let path = json_path(&[FETCHED_METADATA_TAG, tag])?;
    Ok(format!("json_type(metadata, '{}')", path))
}

// ============================================================================
// DocumentQuery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Contents,
    Metadata,
}

impl Column {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Contents => "contents",
            Self::Metadata => "metadata",
        }
    }

    fn path(&self, name: &str) -> Result<String> {
        match self {
            Self::Contents => content_path(name),
            Self::Metadata => metadata_path(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Id(DocumentId),
    Action(String),
    Exists(Column, String),
    NotExists(Column, String),
    Equals(Column, String, Value),
    NotEquals(Column, String, Value),
    /// `metadata.<group>.<stage>` with the stage as one literal key
    StageStamp {
        group: &'static str,
        stage: String,
        present: bool,
    },
}

/// Conjunction of simple predicates over a document's id, action, contents
/// and metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    terms: Vec<Term>,
    order: Option<(Column, String, bool)>,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: DocumentId) -> Self {
        Self::new().require_id(id)
    }

    pub fn require_id(mut self, id: DocumentId) -> Self {
        self.terms.push(Term::Id(id));
        self
    }

    pub fn require_action(mut self, action: impl Into<String>) -> Self {
        self.terms.push(Term::Action(action.into()));
        self
    }

    pub fn require_content_field_exists(mut self, name: impl Into<String>) -> Self {
        self.terms.push(Term::Exists(Column::Contents, name.into()));
        self
    }

    pub fn require_content_field_not_exists(mut self, name: impl Into<String>) -> Self {
        self.terms.push(Term::NotExists(Column::Contents, name.into()));
        self
    }

    pub fn require_content_field_equals(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.terms
            .push(Term::Equals(Column::Contents, name.into(), value.into()));
        self
    }

    pub fn require_content_field_not_equals(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.terms
            .push(Term::NotEquals(Column::Contents, name.into(), value.into()));
        self
    }

    /// `name` may be dotted to reach nested metadata (`touched.parse`).
    pub fn require_metadata_field_exists(mut self, name: impl Into<String>) -> Self {
        self.terms.push(Term::Exists(Column::Metadata, name.into()));
        self
    }

    pub fn require_metadata_field_not_exists(mut self, name: impl Into<String>) -> Self {
        self.terms.push(Term::NotExists(Column::Metadata, name.into()));
        self
    }

    pub fn require_metadata_field_equals(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.terms
            .push(Term::Equals(Column::Metadata, name.into(), value.into()));
        self
    }

    /// Matches documents where the field differs from `value` or is absent.
    pub fn require_metadata_field_not_equals(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.terms
            .push(Term::NotEquals(Column::Metadata, name.into(), value.into()));
        self
    }

    /// Stage names are matched whole, dots included, as claims stamp them.
    pub fn require_fetched_by_stage(self, stage: &str) -> Self {
        self.require_stage_stamp(FETCHED_METADATA_TAG, stage, true)
    }

    pub fn require_not_fetched_by_stage(self, stage: &str) -> Self {
        self.require_stage_stamp(FETCHED_METADATA_TAG, stage, false)
    }

    pub fn require_touched_by_stage(self, stage: &str) -> Self {
        self.require_stage_stamp(TOUCHED_METADATA_TAG, stage, true)
    }

    fn require_stage_stamp(mut self, group: &'static str, stage: &str, present: bool) -> Self {
        self.terms.push(Term::StageStamp {
            group,
            stage: stage.to_string(),
            present,
        });
        self
    }

    /// Order matches by a content field instead of insertion order.
    pub fn order_by_content_field(mut self, name: impl Into<String>, ascending: bool) -> Self {
        self.order = Some((Column::Contents, name.into(), ascending));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl NativeFilter for DocumentQuery {
    fn to_native_filter(&self) -> Result<SqlFilter> {
        if self.terms.is_empty() && self.order.is_none() {
            return Ok(SqlFilter::match_all());
        }

        let mut clauses = Vec::with_capacity(self.terms.len());
        let mut binds = Vec::new();
        for term in &self.terms {
            match term {
                Term::Id(id) => {
                    clauses.push("id = ?".to_string());
                    binds.push(FilterValue::Text(id.to_hex()));
                }
                Term::Action(action) => {
                    clauses.push("action = ?".to_string());
                    binds.push(FilterValue::Text(action.clone()));
                }
                Term::Exists(column, name) => clauses.push(format!(
                    "json_type({}, '{}') IS NOT NULL",
                    column.as_str(),
                    column.path(name)?
                )),
                Term::NotExists(column, name) => clauses.push(format!(
                    "json_type({}, '{}') IS NULL",
                    column.as_str(),
                    column.path(name)?
                )),
                Term::StageStamp {
                    group,
                    stage,
                    present,
                } => clauses.push(format!(
                    "json_type(metadata, '{}') {}",
                    json_path(&[*group, stage.as_str()])?,
                    if *present { "IS NOT NULL" } else { "IS NULL" }
                )),
                Term::Equals(column, name, value) => {
                    clauses.push(format!(
                        "json_extract({}, '{}') = ?",
                        column.as_str(),
                        column.path(name)?
                    ));
                    binds.push(FilterValue::from(value));
                }
                Term::NotEquals(column, name, value) => {
                    clauses.push(format!(
                        "json_extract({}, '{}') IS NOT ?",
                        column.as_str(),
                        column.path(name)?
                    ));
                    binds.push(FilterValue::from(value));
                }
            }
        }

        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        let mut filter = SqlFilter::new(clause, binds);
        if let Some((column, name, ascending)) = &self.order {
            filter = filter.with_order(format!(
                "json_extract({}, '{}') {}, seq ASC",
                column.as_str(),
                column.path(name)?,
                if *ascending { "ASC" } else { "DESC" }
            ));
        }
        Ok(filter)
    }
}
