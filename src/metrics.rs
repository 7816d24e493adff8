//! Self-metrics sink (component K): builds `influx_metrics` insert
//! statements shared by the write buffer (component E, flush timing) and
//! the REST paginator (component F, per-page request timing).

use crate::error::SchemaError;
use crate::query::{InsertQuery, Keyword};
use crate::schema::Table;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One measured operation: a flushed insert batch, or a paginator page
/// request. `subject` is the table name for a flush, or the endpoint/URI
/// for a paginator request.
pub struct SelfMetric {
    pub keyword: Keyword,
    pub subject: String,
    pub duration_ms: f64,
    pub item_count: usize,
    pub error: Option<String>,
}

impl SelfMetric {
    pub fn new(keyword: Keyword, subject: impl Into<String>, duration_ms: f64, item_count: usize) -> Self {
        Self {
            keyword,
            subject: subject.into(),
            duration_ms,
            item_count,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Builds the `influx_metrics` insert statement for this measurement,
    /// tagging by `keyword` and `subject` the same way the flush path and
    /// the paginator both describe their unit of work.
    pub fn to_insert_query(&self, metrics_table: Arc<Table>, captured_at: Option<i64>) -> Result<InsertQuery, SchemaError> {
        let mut fields = BTreeMap::new();
        fields.insert("duration_ms".to_string(), JsonValue::from(self.duration_ms));
        fields.insert("item_count".to_string(), JsonValue::from(self.item_count as u64));
        if let Some(error) = &self.error {
            fields.insert("error".to_string(), JsonValue::from(error.clone()));
        }

        let mut tags = BTreeMap::new();
        tags.insert("keyword".to_string(), JsonValue::from(self.keyword.to_string()));
        tags.insert("tableName".to_string(), JsonValue::from(self.subject.clone()));

        let timestamp = captured_at.map(JsonValue::from).or_else(current_epoch_secs);
        InsertQuery::new(metrics_table, fields, tags, timestamp)
    }
}

fn current_epoch_secs() -> Option<JsonValue> {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).ok().map(|d| JsonValue::from(d.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Datatype, Rp};

    fn metrics_table() -> Arc<Table> {
        let mut fields = BTreeMap::new();
        fields.insert("duration_ms".to_string(), Datatype::Float);
        fields.insert("item_count".to_string(), Datatype::Int);
        Arc::new(Table::new("influx_metrics", fields, vec!["keyword".to_string(), "tableName".to_string()], Arc::new(Rp::days_14())))
    }

    #[test]
    fn builds_insert_with_error_field_when_present() {
        let metric = SelfMetric::new(Keyword::Insert, "jobs", 42.0, 10).with_error("boom");
        let query = metric.to_insert_query(metrics_table(), Some(1_700_000_000)).unwrap();
        let rendered = query.to_query();
        assert!(rendered.contains("tableName=jobs"));
        assert!(rendered.contains("error=\"boom\""));
    }

    #[test]
    fn omits_error_field_when_absent() {
        let metric = SelfMetric::new(Keyword::Select, "/api/endeavour/job", 12.0, 50);
        let query = metric.to_insert_query(metrics_table(), Some(1_700_000_000)).unwrap();
        assert!(!query.to_query().contains("error="));
    }
}
