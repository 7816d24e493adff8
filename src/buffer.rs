//! Write buffer (component E): accumulates per-table `InsertQuery` lines and
//! flushes them to storage in batches, with a self-metrics row appended for
//! every flushed batch.
//!
//! Queries are only ever buffered here, never sent immediately — callers
//! must flush explicitly, which lets a harvester batch many small API pages
//! into one write.

use crate::error::SchemaError;
use crate::metrics::SelfMetric;
use crate::query::{InsertQuery, Keyword};
use crate::schema::Table;
use crate::storage::{StorageClient, WriteOutcome};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Key under which one measurement's pending inserts are buffered: the
/// measurement name, plus a suffix when a call overrides the retention
/// policy so the override doesn't collapse into the table's default-RP
/// entry.
fn buffer_key(table_name: &str, other_retention_policy_name: Option<&str>) -> String {
    match other_retention_policy_name {
        Some(rp) => format!("{table_name}@{rp}"),
        None => table_name.to_string(),
    }
}

const QUERY_MAX_BATCH_SIZE: usize = 10_000;
const FALLBACK_MAX_BATCH_SIZE: usize = 500;

/// One flushed batch's outcome, recorded into `influx_metrics` by the
/// caller that owns the metrics table.
pub struct FlushMetric {
    pub table_name: String,
    pub duration_ms: f64,
    pub item_count: usize,
    pub error: Option<String>,
}

/// Per-table accumulation of line-protocol insert statements awaiting a
/// flush, keyed by the retention policy they write into (a single buffered
/// call may target a non-default RP via `insert_with_retention_policy`).
struct BufferedTable {
    table: Arc<Table>,
    retention_policy_name: String,
    lines: Vec<String>,
}

/// Buffers inserts across many tables and flushes them to a [`StorageClient`]
/// in batches, tracking per-batch timing as [`FlushMetric`]s.
pub struct WriteBuffer {
    storage: Arc<StorageClient>,
    buffers: Mutex<BTreeMap<String, BufferedTable>>,
    metrics_table: Option<Arc<Table>>,
}

impl WriteBuffer {
    pub fn new(storage: Arc<StorageClient>) -> Self {
        Self {
            storage,
            buffers: Mutex::new(BTreeMap::new()),
            metrics_table: None,
        }
    }

    /// Registers the `influx_metrics` table so every flush records its own
    /// `FlushMetric`s as an INSERT-keyword self-metrics row, the way the
    /// REST paginator already records its SELECT-keyword page timings.
    pub fn with_metrics_table(mut self, table: Arc<Table>) -> Self {
        self.metrics_table = Some(table);
        self
    }

    /// Splits each record in `records` by `table`'s declared layout and
    /// appends the resulting insert statements to the buffer. Records that
    /// fail to format (e.g. no fields left after dropping nulls) are
    /// skipped and logged rather than aborting the whole batch.
    pub async fn insert_dicts(&self, table: Arc<Table>, records: Vec<Map<String, JsonValue>>) {
        self.insert_dicts_with_rp(table, records, None).await
    }

    pub async fn insert_dicts_with_rp(&self, table: Arc<Table>, records: Vec<Map<String, JsonValue>>, other_retention_policy_name: Option<String>) {
        if records.is_empty() {
            debug!(table = %table.name, "nothing to insert, empty record list");
            return;
        }

        let mut lines = Vec::with_capacity(records.len());
        for record in &records {
            let (tags, fields, timestamp) = table.split_by_table_def(record);
            match InsertQuery::new(table.clone(), fields, tags, timestamp) {
                Ok(query) => lines.push(query.to_query()),
                Err(err) => warn!(table = %table.name, error = %err, "skipping record that failed to format for insert"),
            }
        }

        let rp_name = other_retention_policy_name.unwrap_or_else(|| table.retention_policy.name.clone());
        let key = buffer_key(&table.name, other_retention_policy_name.as_deref());
        let mut buffers = self.buffers.lock().await;
        let entry = buffers.entry(key).or_insert_with(|| BufferedTable {
            table: table.clone(),
            retention_policy_name: rp_name,
            lines: Vec::new(),
        });
        let added = lines.len();
        entry.lines.extend(lines);
        debug!(table = %table.name, added, "appended records to insert buffer");

        let needs_flush = entry.lines.len() > 2 * QUERY_MAX_BATCH_SIZE;
        drop(buffers);
        if needs_flush {
            let _ = self.flush(false).await;
        }
    }

    /// Flushes every buffered table, one HTTP write per table, and returns
    /// one [`FlushMetric`] per table actually sent. `fallback` selects the
    /// smaller batch size and disables the one-shot retry-with-fallback
    /// path (a fallback flush that itself fails is not retried again).
    pub async fn flush(&self, fallback: bool) -> Vec<FlushMetric> {
        let mut buffers = self.buffers.lock().await;
        let keys: Vec<String> = buffers.keys().cloned().collect();
        let mut metrics = Vec::new();

        for key in keys {
            let Some(entry) = buffers.remove(&key) else { continue };
            if entry.lines.is_empty() {
                continue;
            }
            metrics.push(self.send_batch(entry, fallback).await);
        }
        drop(buffers);

        if let Some(metrics_table) = self.metrics_table.clone() {
            for metric in &metrics {
                let _ = self
                    .record_metric(metrics_table.clone(), Keyword::Insert, &metric.table_name, metric.duration_ms, metric.item_count, metric.error.clone())
                    .await;
            }
        }
        metrics
    }

    /// Sends one table's buffered lines, retrying once with the fallback
    /// batch size if the first attempt hit a retryable error. Does not
    /// retry again on a fallback attempt's own failure.
    async fn send_batch(&self, entry: BufferedTable, fallback: bool) -> FlushMetric {
        let batch_size = if fallback { FALLBACK_MAX_BATCH_SIZE } else { QUERY_MAX_BATCH_SIZE };
        let item_count = entry.lines.len();
        let start = Instant::now();

        let mut error_msg = None;
        let mut re_send = false;
        for chunk in entry.lines.chunks(batch_size) {
            match self.storage.write_lines(&entry.retention_policy_name, chunk).await {
                Ok(()) => {}
                Err(WriteOutcome::Ignored) => {}
                Err(WriteOutcome::PartialParse(body)) => {
                    warn!(table = %entry.table.name, "some messages were lost sending insert buffer, rest written ok");
                    error_msg = Some(body);
                }
                Err(WriteOutcome::Retryable(body)) => {
                    warn!(table = %entry.table.name, "error sending insert buffer");
                    error_msg = Some(body);
                    re_send = true;
                }
            }
        }

        if re_send && !fallback {
            warn!(table = %entry.table.name, "retrying insert buffer with fallback batch size");
            return Box::pin(self.send_batch(entry, true)).await;
        }

        FlushMetric {
            table_name: entry.table.name.clone(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            item_count,
            error: error_msg,
        }
    }

    /// Appends a self-metrics row directly to the buffer without going
    /// through `insert_dicts` (the metrics table is written by the buffer
    /// itself, not by a collector).
    pub async fn record_metric(&self, metrics_table: Arc<Table>, keyword: Keyword, table_name: &str, duration_ms: f64, item_count: usize, error: Option<String>) -> Result<(), SchemaError> {
        let mut metric = SelfMetric::new(keyword, table_name, duration_ms, item_count);
        if let Some(error) = error {
            metric = metric.with_error(error);
        }
        let query = metric.to_insert_query(metrics_table.clone(), None)?;
        let mut buffers = self.buffers.lock().await;
        let entry = buffers.entry(buffer_key(&metrics_table.name, None)).or_insert_with(|| BufferedTable {
            table: metrics_table.clone(),
            retention_policy_name: metrics_table.retention_policy.name.clone(),
            lines: Vec::new(),
        });
        entry.lines.push(query.to_query());
        Ok(())
    }
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

    fn jobs_table(rp: crate::schema::RetentionPolicy) -> Arc<Table> {
        let mut fields = BTreeMap::new();
        fields.insert("duration".to_string(), Datatype::Float);
        Arc::new(Table::new("jobs", fields, vec!["jobName".to_string()], Arc::new(rp)))
    }

    #[tokio::test]
    async fn record_metric_buffers_a_line_for_the_metrics_table() {
        let storage = Arc::new(StorageClient::new(reqwest::Client::new(), "http://localhost:8086", "sppmon"));
        let buffer = WriteBuffer::new(storage);
        let table = metrics_table();
        buffer.record_metric(table.clone(), Keyword::Insert, "jobs", 12.5, 3, None).await.unwrap();
        let buffers = buffer.buffers.lock().await;
        assert_eq!(buffers.get("influx_metrics").unwrap().lines.len(), 1);
    }

    #[tokio::test]
    async fn insert_dicts_keys_buffer_by_measurement_not_retention_policy() {
        // jobs and vmReplicateSummary share rp_days_90; they must not collapse
        // into one buffered entry.
        let storage = Arc::new(StorageClient::new(reqwest::Client::new(), "http://localhost:8086", "sppmon"));
        let buffer = WriteBuffer::new(storage);
        let jobs = jobs_table(Rp::days_90());
        let mut vm_fields = BTreeMap::new();
        vm_fields.insert("duration".to_string(), Datatype::Float);
        let vm_replicate_summary = Arc::new(Table::new("vmReplicateSummary", vm_fields, vec!["vmName".to_string()], Arc::new(Rp::days_90())));

        let mut record = Map::new();
        record.insert("jobName".to_string(), JsonValue::String("nightly".to_string()));
        record.insert("duration".to_string(), JsonValue::from(10));
        buffer.insert_dicts(jobs.clone(), vec![record.clone()]).await;

        let mut vm_record = Map::new();
        vm_record.insert("vmName".to_string(), JsonValue::String("vm1".to_string()));
        vm_record.insert("duration".to_string(), JsonValue::from(20));
        buffer.insert_dicts(vm_replicate_summary.clone(), vec![vm_record]).await;

        let buffers = buffer.buffers.lock().await;
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers.get("jobs").unwrap().table.name, "jobs");
        assert_eq!(buffers.get("vmReplicateSummary").unwrap().table.name, "vmReplicateSummary");
    }

    #[tokio::test]
    async fn insert_dicts_skips_empty_record_list() {
        let storage = Arc::new(StorageClient::new(reqwest::Client::new(), "http://localhost:8086", "sppmon"));
        let buffer = WriteBuffer::new(storage);
        let table = metrics_table();
        buffer.insert_dicts(table, vec![]).await;
        assert!(buffer.buffers.lock().await.is_empty());
    }
}
