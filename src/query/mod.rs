//! Query AST (component B): builds INSERT line-protocol statements and
//! SELECT/DELETE/CONTINUOUS QUERY InfluxQL-style statements, with the
//! escaping rules the wire format requires.
//!
//! `InsertQuery` is only ever constructed by the write buffer (component E)
//! from a table's declared field types; `SelectionQuery`/`ContinuousQuery`
//! are built directly by callers (the schema catalog, the harvester).

use crate::error::SchemaError;
use crate::schema::{Datatype, RetentionPolicy, Table};
use crate::time_literal::TimeLiteral;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The statement kind a query renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Select,
    Delete,
    Insert,
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Keyword::Select => "SELECT",
            Keyword::Delete => "DELETE",
            Keyword::Insert => "INSERT",
        };
        write!(f, "{s}")
    }
}

/// Characters that must be escaped with a backslash in tag/field keys and
/// string tag values: `=`, space, comma, and embedded newlines.
fn escape_bad_name_chars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' => out.push_str("\\="),
            ' ' => out.push_str("\\ "),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Escapes a string field value for embedding inside double quotes:
/// quotes and newlines are escaped, nothing else.
fn escape_string_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Renders a JSON scalar to a timestamp's epoch-seconds form, truncating
/// down from millisecond/nanosecond precision if the magnitude implies it.
fn json_to_epoch_secs(value: &JsonValue) -> i64 {
    let mut n = match value {
        JsonValue::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        JsonValue::String(s) => s.parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    // Repeatedly divide by 1000 while the magnitude still looks sub-second
    // precision (ms or ns), matching the epoch-normalizing truncation used
    // throughout the ingestion pipeline.
    while n.abs() >= 99_999_999_999 {
        n /= 1000;
    }
    n
}

/// An `INSERT`-style line-protocol statement for one point. Always
/// constructed from a table's declared field types, so formatting is
/// deterministic rather than relying on ad-hoc per-value inference.
pub struct InsertQuery {
    table: Arc<Table>,
    fields: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    time_stamp: Option<i64>,
}

impl InsertQuery {
    /// Builds an insert statement, formatting `fields`/`tags` per the
    /// table's datatype declarations. If every field formats away to
    /// nothing (all `None`/empty), the first declared string field is
    /// autofilled with `"autofilled"` so the statement is never empty —
    /// a point with zero fields is otherwise rejected by the wire format.
    pub fn new(table: Arc<Table>, fields: BTreeMap<String, JsonValue>, tags: BTreeMap<String, JsonValue>, time_stamp: Option<JsonValue>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::EmptyInsert("need at least one field to insert".to_string()));
        }
        let time_stamp = time_stamp.as_ref().map(json_to_epoch_secs);
        let mut formatted = Self::format_fields(&table, fields);
        if formatted.is_empty() {
            if let Some((key, _)) = table.fields.iter().find(|(_, dt)| **dt == Datatype::String) {
                formatted.insert(key.clone(), "\"autofilled\"".to_string());
            }
        }
        if formatted.is_empty() {
            return Err(SchemaError::EmptyInsert("fields after formatting empty, need at least one value".to_string()));
        }
        Ok(Self {
            table,
            fields: formatted,
            tags: Self::format_tags(tags),
            time_stamp,
        })
    }

    /// Casts and escapes each field to its declared (or auto-detected)
    /// datatype's wire representation. `null`/missing values are dropped.
    fn format_fields(table: &Table, fields: BTreeMap<String, JsonValue>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in fields {
            if value.is_null() {
                continue;
            }
            let datatype = table.fields.get(&key).copied().unwrap_or_else(|| Datatype::auto_detect(&value));
            let escaped_key = escape_bad_name_chars(&key);

            let rendered = match datatype {
                Datatype::String => {
                    let s = match &value {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    format!("\"{}\"", escape_string_field(&s))
                }
                Datatype::Timestamp => format!("{}i", json_to_epoch_secs(&value)),
                Datatype::Int => format!("{}i", value.as_i64().unwrap_or_default()),
                Datatype::Float => format!("{}", value.as_f64().unwrap_or_default()),
                Datatype::Bool => format!("{}", value.as_bool().unwrap_or_default()),
            };
            out.insert(escaped_key, rendered);
        }
        out
    }

    /// Stringifies and escapes every tag value; `null` tags are dropped.
    fn format_tags(tags: BTreeMap<String, JsonValue>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in tags {
            if value.is_null() {
                continue;
            }
            let value_str = match &value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(escape_bad_name_chars(&key), escape_bad_name_chars(&value_str));
        }
        out
    }

    pub fn to_query(&self) -> String {
        let tag_str = if self.tags.is_empty() {
            String::new()
        } else {
            format!(",{}", self.tags.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
        };
        let fields_str = self.fields.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
        let time_str = self.time_stamp.map(|t| t.to_string()).unwrap_or_default();
        format!("{}{} {} {}", self.table.name, tag_str, fields_str, time_str)
    }
}

/// Either a declared table or a nested `SELECT` used as a query's source.
#[derive(Clone)]
pub enum Source {
    Table(Arc<Table>),
    Nested(Box<SelectionQuery>),
}

/// A `SELECT` or `DELETE` statement. `DELETE` forbids `INTO`, field lists,
/// grouping, ordering, and limits — validated in [`SelectionQuery::to_query`]
/// rather than at construction, since the builder is assembled
/// incrementally.
#[derive(Clone)]
pub struct SelectionQuery {
    keyword: Keyword,
    source: Source,
    alt_rp: Option<Arc<RetentionPolicy>>,
    into_table: Option<Arc<Table>>,
    fields: Option<Vec<String>>,
    where_clause: Option<String>,
    group_list: Option<Vec<String>>,
    order_direction: Option<String>,
    limit: u64,
    s_limit: u64,
}

impl SelectionQuery {
    pub fn new(keyword: Keyword, table: Arc<Table>) -> Self {
        Self {
            keyword,
            source: Source::Table(table),
            alt_rp: None,
            into_table: None,
            fields: None,
            where_clause: None,
            group_list: None,
            order_direction: None,
            limit: 0,
            s_limit: 0,
        }
    }

    /// A `SELECT` sourced from a nested `SELECT`, rendered as `FROM (...)`.
    pub fn nested(inner: SelectionQuery) -> Self {
        Self {
            keyword: Keyword::Select,
            source: Source::Nested(Box::new(inner)),
            alt_rp: None,
            into_table: None,
            fields: None,
            where_clause: None,
            group_list: None,
            order_direction: None,
            limit: 0,
            s_limit: 0,
        }
    }

    pub fn into_table(mut self, table: Arc<Table>) -> Self {
        self.into_table = Some(table);
        self
    }

    pub fn alt_rp(mut self, rp: Arc<RetentionPolicy>) -> Self {
        self.alt_rp = Some(rp);
        self
    }

    /// An empty field list renders as `*`.
    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(if fields.is_empty() { vec!["*".to_string()] } else { fields });
        self
    }

    pub fn where_clause(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// An empty group list renders as `GROUP BY *`.
    pub fn group_by(mut self, group_list: Vec<String>) -> Self {
        self.group_list = Some(if group_list.is_empty() { vec!["*".to_string()] } else { group_list });
        self
    }

    /// Ordering only ever applies to `"time"` — the wire format has no
    /// other orderable column for these statements.
    pub fn order_by_time(mut self, direction: impl Into<String>) -> Self {
        self.order_direction = Some(direction.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn s_limit(mut self, s_limit: u64) -> Self {
        self.s_limit = s_limit;
        self
    }

    pub fn into_table_ref(&self) -> Option<&Arc<Table>> {
        self.into_table.as_ref()
    }

    /// The table this query selects from, if its source is a declared table
    /// rather than a nested `SELECT`.
    pub fn source_table(&self) -> Option<&Arc<Table>> {
        match &self.source {
            Source::Table(table) => Some(table),
            Source::Nested(_) => None,
        }
    }

    pub fn where_clause_ref(&self) -> Option<&str> {
        self.where_clause.as_deref()
    }

    pub fn to_query(&self) -> Result<String, SchemaError> {
        if self.keyword == Keyword::Delete && (self.into_table.is_some() || self.fields.is_some() || self.group_list.is_some() || self.order_direction.is_some() || self.limit > 0 || self.s_limit > 0) {
            return Err(SchemaError::InvalidQuery("DELETE statement does not support additional fields".to_string()));
        }

        let fields_str = match &self.fields {
            Some(fields) if fields.as_slice() == ["*"] => "*".to_string(),
            Some(fields) => fields.join(", "),
            None => String::new(),
        };

        let into_str = match &self.into_table {
            Some(table) => format!("INTO {table}"),
            None => String::new(),
        };

        let table_str = match (&self.source, &self.alt_rp) {
            (Source::Nested(inner), _) => format!("FROM ({})", inner.to_query()?),
            (Source::Table(table), _) if self.keyword == Keyword::Delete => format!("FROM {}", table.name),
            (Source::Table(table), Some(alt_rp)) => format!("FROM {}.{}", alt_rp.name, table.name),
            (Source::Table(table), None) => format!("FROM {table}"),
        };

        let where_str = match &self.where_clause {
            Some(clause) if !clause.is_empty() => format!("WHERE {clause}"),
            _ => String::new(),
        };

        let group_str = match &self.group_list {
            Some(list) => format!("GROUP BY {}", list.join(", ")),
            None => String::new(),
        };

        let order_str = match &self.order_direction {
            Some(direction) => format!("ORDER BY \"time\" {direction}"),
            None => String::new(),
        };

        let limit_str = if self.limit > 0 { format!("LIMIT {}", self.limit) } else { String::new() };
        let s_limit_str = if self.s_limit > 0 { format!("SLIMIT {}", self.s_limit) } else { String::new() };

        let rendered = [self.keyword.to_string(), fields_str, into_str, table_str, where_str, group_str, order_str, limit_str, s_limit_str]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(rendered)
    }
}

/// A `CREATE CONTINUOUS QUERY` statement wrapping a `SELECT ... INTO ...`.
/// Always built from a [`SelectionQuery`] that already carries an
/// `INTO` clause — constructing one without it is a catalog-declaration bug,
/// not a runtime condition, so [`ContinuousQuery::new`] asserts rather than
/// returning a `Result`.
#[derive(Clone)]
pub struct ContinuousQuery {
    pub name: String,
    database_name: String,
    select_query: SelectionQuery,
    every_interval: Option<TimeLiteral>,
    for_interval: Option<TimeLiteral>,
}

impl ContinuousQuery {
    pub fn new(name: impl Into<String>, database_name: impl Into<String>, select_query: SelectionQuery) -> Self {
        debug_assert!(select_query.into_table_ref().is_some(), "continuous query requires an INTO clause");
        Self {
            name: name.into(),
            database_name: database_name.into(),
            select_query,
            every_interval: None,
            for_interval: None,
        }
    }

    pub fn every(mut self, interval: TimeLiteral) -> Self {
        self.every_interval = Some(interval);
        self
    }

    pub fn for_interval(mut self, interval: TimeLiteral) -> Self {
        self.for_interval = Some(interval);
        self
    }

    pub fn select_query(&self) -> Option<&SelectionQuery> {
        Some(&self.select_query)
    }

    pub fn to_query(&self) -> String {
        let every_str = self.every_interval.as_ref().map(|i| format!("EVERY {i}")).unwrap_or_default();
        let for_str = self.for_interval.as_ref().map(|i| format!("FOR {i}")).unwrap_or_default();
        let resample = [every_str, for_str].into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ");
        let resample_str = if resample.is_empty() { String::new() } else { format!("RESAMPLE {resample}") };

        let select = self.select_query.to_query().unwrap_or_default();
        let parts = ["CREATE CONTINUOUS QUERY".to_string(), self.name.clone(), "ON".to_string(), self.database_name.clone(), resample_str, "BEGIN".to_string(), select, "END".to_string()];
        parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join(" ")
    }
}

impl PartialEq for ContinuousQuery {
    fn eq(&self, other: &Self) -> bool {
        self.to_query() == other.to_query()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Rp;

    fn sample_table() -> Arc<Table> {
        let mut fields = BTreeMap::new();
        fields.insert("duration".to_string(), Datatype::Int);
        fields.insert("name".to_string(), Datatype::String);
        Arc::new(Table::new("jobs", fields, vec!["jobId".to_string()], Arc::new(Rp::days_90())))
    }

    #[test]
    fn insert_query_escapes_tag_and_field_keys() {
        let table = sample_table();
        let mut fields = BTreeMap::new();
        fields.insert("duration".to_string(), JsonValue::from(42));
        let mut tags = BTreeMap::new();
        tags.insert("jobId".to_string(), JsonValue::from("J=1, 2"));

        let query = InsertQuery::new(table, fields, tags, None).unwrap();
        assert_eq!(query.to_query(), "jobs,jobId=J\\=1\\,\\ 2 duration=42i ");
    }

    #[test]
    fn insert_query_autofills_when_all_fields_drop() {
        let table = sample_table();
        let mut fields = BTreeMap::new();
        fields.insert("duration".to_string(), JsonValue::Null);
        let query = InsertQuery::new(table, fields, BTreeMap::new(), None).unwrap();
        assert!(query.to_query().contains("name=\"autofilled\""));
    }

    #[test]
    fn delete_statement_rejects_extra_clauses() {
        let table = sample_table();
        let query = SelectionQuery::new(Keyword::Delete, table).limit(5);
        assert!(query.to_query().is_err());
    }

    #[test]
    fn select_statement_renders_from_alt_rp() {
        let table = sample_table();
        let rp = Arc::new(Rp::inf());
        let query = SelectionQuery::new(Keyword::Select, table).alt_rp(rp).fields(vec![]);
        let rendered = query.to_query().unwrap();
        assert!(rendered.contains("FROM rp_inf.jobs"));
        assert!(rendered.contains("SELECT *"));
    }

    #[test]
    fn continuous_query_wraps_select_into() {
        let table = sample_table();
        let into_table = Arc::new(table.with_retention_policy(Arc::new(Rp::inf())));
        let select = SelectionQuery::new(Keyword::Select, table)
            .into_table(into_table)
            .fields(vec!["mean(duration) AS duration".to_string()])
            .group_by(vec!["time(1w)".to_string()]);
        let cq = ContinuousQuery::new("cq_jobs_0", "sppmon", select).for_interval(TimeLiteral::parse("1w").unwrap());
        let rendered = cq.to_query();
        assert!(rendered.starts_with("CREATE CONTINUOUS QUERY cq_jobs_0 ON sppmon"));
        assert!(rendered.contains("RESAMPLE FOR 1w"));
        assert!(rendered.contains("BEGIN SELECT"));
        assert!(rendered.ends_with("END"));
    }
}
