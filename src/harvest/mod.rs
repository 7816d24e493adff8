//! Job-log harvester (component G). The design centerpiece: enumerates job
//! sessions, discovers which ones have no logs stored yet, fetches and
//! parses their logs through the message-log parser registry (component H),
//! and atomically swaps the affected session rows to `jobsLogsStored =
//! "True"`.
//!
//! A session is only ever marked stored after its logs and derived rows
//! have been buffered — the atomic delete-then-reinsert swap at the end of
//! [`JobHarvester::harvest_job_logs`] is what makes that guarantee hold even
//! though the underlying store has no `UPDATE`.

use crate::buffer::WriteBuffer;
use crate::error::HarvestError;
use crate::parsers;
use crate::query::{Keyword, SelectionQuery};
use crate::rest::RestClient;
use crate::schema::{Catalog, Table};
use crate::storage::StorageClient;
use crate::time_literal::TimeLiteral;
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The job-log `type` values to request, chosen by the `jobLog_details`
/// config flag: the full set, or just session summaries.
pub fn log_types(full_detail: bool) -> Vec<String> {
    if full_detail {
        ["INFO", "DEBUG", "ERROR", "SUMMARY", "WARN"].iter().map(|s| s.to_string()).collect()
    } else {
        vec!["SUMMARY".to_string()]
    }
}

/// Harvests job sessions and their logs into the schema's `jobs`,
/// `jobs_statistics`, and `jobLogs` measurements, plus whatever derived
/// measurements the parser registry produces.
pub struct JobHarvester {
    storage: Arc<StorageClient>,
    rest: Arc<RestClient>,
    buffer: Arc<WriteBuffer>,
    catalog: Arc<Catalog>,
    job_log_retention_time: TimeLiteral,
    job_log_types: Vec<String>,
}

impl JobHarvester {
    pub fn new(storage: Arc<StorageClient>, rest: Arc<RestClient>, buffer: Arc<WriteBuffer>, catalog: Arc<Catalog>, job_log_retention_time: TimeLiteral, job_log_types: Vec<String>) -> Self {
        Self {
            storage,
            rest,
            buffer,
            catalog,
            job_log_retention_time,
            job_log_types,
        }
    }

    /// Session enumeration: walks every job the API knows about and buffers
    /// any session the TSDB doesn't have a row for yet. Call this before
    /// [`Self::harvest_job_logs`] on every run, not just the first.
    pub async fn enumerate_sessions(&self) -> Result<(), HarvestError> {
        let jobs_table = self.catalog.database.table("jobs")?.clone();
        let stats_table = self.catalog.database.table("jobs_statistics")?.clone();

        let jobs = self.rest.get_objects("/api/endeavour/job", Some("jobs"), Some(&["id", "name"]), None, false, &[]).await?;

        for job in jobs {
            let (Some(job_id), Some(job_name)) = (job.get("id").and_then(JsonValue::as_str), job.get("name").and_then(JsonValue::as_str)) else {
                warn!(?job, "skipping job missing id or name");
                continue;
            };
            info!(job_name, "capturing job information");
            if let Err(err) = self.harvest_job_sessions(&jobs_table, &stats_table, job_id).await {
                warn!(job_id, error = %err, "error getting sessions for job, skipping it");
            }
        }
        Ok(())
    }

    async fn harvest_job_sessions(&self, jobs_table: &Arc<Table>, stats_table: &Arc<Table>, job_id: &str) -> Result<(), HarvestError> {
        let where_str = format!("jobId = '{job_id}' AND time > now() - {}", jobs_table.retention_policy.duration);
        let known_query = SelectionQuery::new(Keyword::Select, jobs_table.clone()).fields(vec!["id".to_string(), "jobName".to_string()]).where_clause(where_str);
        let known_result = self.storage.send_selection_query(&known_query).await?;
        let known_ids: BTreeSet<i64> = rows_as_maps(&known_result).iter().filter_map(|row| row.get("id").and_then(JsonValue::as_i64)).collect();

        let retention_secs = jobs_table.retention_policy.duration.to_seconds().unwrap_or(0);
        let cutoff_ms = now_ms().saturating_sub(retention_secs * 1000) as i64;

        let endpoint = format!("/api/endeavour/jobsession/history/jobid/{job_id}");
        let allow_list = ["id", "jobId", "jobName", "start", "end", "duration", "status", "indexStatus", "subPolicyType", "type", "numTasks", "percent", "properties.statistics"];
        let sessions = self.rest.get_objects(&endpoint, Some("sessions"), Some(&allow_list), None, false, &[]).await?;

        // the history endpoint takes no filter parameter, so apply the
        // retention cutoff locally to avoid a silent RP drop downstream.
        let latest: Vec<Map<String, JsonValue>> = sessions.into_iter().filter(|s| s.get("start").and_then(JsonValue::as_i64).map(|start| start > cutoff_ms).unwrap_or(false)).collect();

        let missing: Vec<Map<String, JsonValue>> = latest.into_iter().filter(|s| !s.get("id").and_then(JsonValue::as_i64).map(|id| known_ids.contains(&id)).unwrap_or(false)).collect();

        if missing.is_empty() {
            debug!(job_id, "no new sessions to insert");
            return Ok(());
        }
        info!(job_id, count = missing.len(), "missing sessions in DB");

        let (sessions_clean, stats_rows) = extract_statistics(missing);
        if !stats_rows.is_empty() {
            self.buffer.insert_dicts(stats_table.clone(), stats_rows).await;
        }
        self.buffer.insert_dicts(jobs_table.clone(), sessions_clean).await;
        Ok(())
    }

    /// Unharvested-session discovery, per-session harvesting, and the
    /// atomic swap. Call [`Self::enumerate_sessions`] first on a cold store
    /// so there is something to harvest.
    pub async fn harvest_job_logs(&self) -> Result<(), HarvestError> {
        let jobs_table = self.catalog.database.table("jobs")?.clone();
        let joblogs_table = self.catalog.database.table("jobLogs")?.clone();

        let where_str = format!("jobsLogsStored <> 'True' and time > now() - {} AND time > now() - {}", self.job_log_retention_time, jobs_table.retention_policy.duration);

        let select = SelectionQuery::new(Keyword::Select, jobs_table.clone()).fields(vec!["*".to_string()]).where_clause(where_str.clone());
        let result = self.storage.send_selection_query(&select).await?;
        let missing_logs_sessions = rows_as_maps(&result);
        info!(count = missing_logs_sessions.len(), "sessions with no stored logs");

        let known_ids = parsers::known_ids();
        let mut job_update_list = Vec::new();
        let mut logs_requested_total = 0usize;
        let mut logs_to_stats_total = 0usize;

        for (index, session) in missing_logs_sessions.into_iter().enumerate() {
            let Some(session_id) = session.get("id").and_then(JsonValue::as_i64) else {
                warn!(?session, "session row missing id, skipping");
                continue;
            };
            if index % 5 == 0 {
                info!(index, session_id, "computing joblogs for session");
            }

            // The atomic swap below deletes every row matching the discovery
            // predicate, this session included. A session that fails here
            // must still be carried through unchanged, or the swap would
            // silently drop it instead of leaving it unharvested.
            let logs = match self.fetch_session_logs(session_id, &known_ids).await {
                Ok(logs) => logs,
                Err(err) => {
                    warn!(session_id, error = %err, "error requesting joblogs for session, will retry next run");
                    job_update_list.push(session);
                    continue;
                }
            };

            let log_count = logs.len();
            logs_requested_total += log_count;
            debug!(session_id, log_count, "found logs for session");

            let enriched = enrich_logs(logs, &session);

            match self.write_derived_rows(&enriched).await {
                Ok(()) => logs_to_stats_total += log_count,
                Err(err) => warn!(session_id, error = %err, "failed parsing joblogs into derived rows, skipping for this session"),
            }

            let dumped = dump_message_params(enriched);
            self.buffer.insert_dicts(joblogs_table.clone(), dumped).await;

            let mut updated = session;
            updated.insert("jobLogsCount".to_string(), JsonValue::from(log_count as i64));
            updated.insert("jobsLogsStored".to_string(), JsonValue::from("True"));
            job_update_list.push(updated);
        }

        let delete_query = SelectionQuery::new(Keyword::Delete, jobs_table.clone()).where_clause(where_str);
        self.storage.send_selection_query(&delete_query).await.map_err(|e| HarvestError::SwapFailed(e.to_string()))?;

        let updated_count = job_update_list.len();
        self.buffer.insert_dicts(jobs_table.clone(), job_update_list).await;

        if logs_requested_total != logs_to_stats_total {
            info!(logs_requested_total, logs_to_stats_total, "requested more logs than were computed into stats");
        } else {
            info!(logs_requested_total, "requested and computed all logs");
        }
        info!(updated_count, "updated job sessions with stored logs");
        Ok(())
    }

    async fn fetch_session_logs(&self, session_id: i64, known_ids: &[&str]) -> Result<Vec<Map<String, JsonValue>>, HarvestError> {
        let allow_list = ["jobsessionId", "logTime", "id", "messageId", "message", "messageParams", "type"];
        let filter = build_log_filter(session_id, &self.job_log_types, known_ids);
        let logs = self.rest.get_objects("/api/endeavour/log/job", Some("logs"), Some(&allow_list), None, false, &[("filter", &filter)]).await?;
        Ok(logs)
    }

    /// Runs the message-log parser registry over `logs`, sorted by
    /// `logTime`, and buffers each produced row into its destination
    /// measurement. Timestamp collisions within `vmBackupSummary` are
    /// resolved by a monotonic counter scoped to this one session's batch.
    async fn write_derived_rows(&self, logs: &[Map<String, JsonValue>]) -> Result<(), HarvestError> {
        let mut recognized: Vec<&Map<String, JsonValue>> = logs.iter().filter(|log| log.get("messageId").and_then(JsonValue::as_str).is_some_and(|id| parsers::lookup(id).is_some())).collect();
        recognized.sort_by_key(|log| log.get("logTime").and_then(JsonValue::as_i64).unwrap_or(0));

        let mut max_sec_timestamp: i64 = 0;
        let mut rows_by_table: BTreeMap<String, Vec<Map<String, JsonValue>>> = BTreeMap::new();

        for log in recognized {
            let message_id = log.get("messageId").and_then(JsonValue::as_str).unwrap_or_default();
            let entry = parsers::lookup(message_id).expect("filtered to recognized message ids above");

            let params: Vec<JsonValue> = log.get("messageParams").and_then(JsonValue::as_array).cloned().unwrap_or_default();
            let mut row = match (entry.map_params)(&params) {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(err) => {
                    warn!(message_id, error = %err, "message params did not match the registered shape, skipping log");
                    continue;
                }
            };

            let mut missing_extra = false;
            for field in entry.extra_fields {
                match log.get(field.source) {
                    Some(value) => {
                        row.insert(field.dest.to_string(), value.clone());
                    }
                    None => {
                        missing_extra = true;
                        break;
                    }
                }
            }
            if missing_extra {
                warn!(message_id, "log missing an expected session field, skipping derived row");
                continue;
            }

            let Some(mut cur_timestamp) = log.get("logTime").and_then(JsonValue::as_i64) else {
                warn!(message_id, "log has no logTime, skipping derived row");
                continue;
            };

            // Issue 9 upstream: identical tag sets can collide at second
            // resolution. Bump forward rather than lose the row, accepting
            // a little timestamp drift for this measurement.
            if entry.destination == "vmBackupSummary" {
                let cur_sec_timestamp = to_epoch_secs(cur_timestamp);
                if cur_sec_timestamp > 0 && cur_sec_timestamp <= max_sec_timestamp {
                    let digits = cur_timestamp / cur_sec_timestamp;
                    max_sec_timestamp += 1;
                    cur_timestamp = max_sec_timestamp * digits;
                } else {
                    max_sec_timestamp = cur_sec_timestamp;
                }
            }

            let table = self.catalog.database.table(entry.destination)?;
            row.insert(table.time_key.clone(), JsonValue::from(cur_timestamp));
            scrub_null_strings(&mut row);

            rows_by_table.entry(entry.destination.to_string()).or_default().push(row);
        }

        for (table_name, rows) in rows_by_table {
            let table = self.catalog.database.table(&table_name)?.clone();
            self.buffer.insert_dicts(table, rows).await;
        }
        Ok(())
    }
}

/// Builds the REST filter this API expects: `jobsessionId = <id> AND type
/// IN <types> AND messageId IN <known registry ids>`.
fn build_log_filter(session_id: i64, job_log_types: &[String], known_ids: &[&str]) -> String {
    serde_json::json!([
        {"property": "jobsessionId", "value": session_id.to_string(), "op": "="},
        {"property": "type", "value": job_log_types, "op": "IN"},
        {"property": "messageId", "value": known_ids, "op": "IN"},
    ])
    .to_string()
}

/// Injects session fields into each log and renames the API's `id`/
/// `jobsessionId` to the measurement's `jobLogId`/`jobSessionId`.
fn enrich_logs(logs: Vec<Map<String, JsonValue>>, session: &Map<String, JsonValue>) -> Vec<Map<String, JsonValue>> {
    let job_id = session.get("jobId").cloned().unwrap_or(JsonValue::Null);
    let job_name = session.get("jobName").cloned().unwrap_or(JsonValue::Null);
    let start = session.get("start").cloned().unwrap_or(JsonValue::Null);

    logs.into_iter()
        .map(|mut log| {
            log.insert("jobId".to_string(), job_id.clone());
            log.insert("jobName".to_string(), job_name.clone());
            log.insert("jobExecutionTime".to_string(), start.clone());
            if let Some(id) = log.remove("id") {
                log.insert("jobLogId".to_string(), id);
            }
            if let Some(session_id) = log.remove("jobsessionId") {
                log.insert("jobSessionId".to_string(), session_id);
            }
            log
        })
        .collect()
}

/// Stringifies `messageParams` so it can be stored as a single field,
/// done only after derived-row extraction has read it as an array.
fn dump_message_params(mut logs: Vec<Map<String, JsonValue>>) -> Vec<Map<String, JsonValue>> {
    for log in &mut logs {
        if let Some(params) = log.get("messageParams") {
            let dumped = params.to_string();
            log.insert("messageParams".to_string(), JsonValue::from(dumped));
        }
    }
    logs
}

/// Extracts the nested `properties.statistics` list from each session into
/// its own set of rows (one per resource type), removing it from the
/// session record in the process.
fn extract_statistics(mut sessions: Vec<Map<String, JsonValue>>) -> (Vec<Map<String, JsonValue>>, Vec<Map<String, JsonValue>>) {
    let mut stats_rows = Vec::new();

    for session in &mut sessions {
        let Some(JsonValue::Array(stats)) = session.remove("properties.statistics") else { continue };

        for stat in stats {
            let Some(stat) = stat.as_object() else { continue };
            let total = stat.get("total").and_then(JsonValue::as_i64).unwrap_or(0);
            let success = stat.get("success").and_then(JsonValue::as_i64).unwrap_or(0);
            let failed = stat.get("failed").and_then(JsonValue::as_i64).unwrap_or(0);
            let skipped = stat.get("skipped").and_then(JsonValue::as_i64).unwrap_or(total - success - failed);

            let mut row = Map::new();
            row.insert("resourceType".to_string(), stat.get("resourceType").cloned().unwrap_or(JsonValue::Null));
            row.insert("total".to_string(), JsonValue::from(total));
            row.insert("success".to_string(), JsonValue::from(success));
            row.insert("failed".to_string(), JsonValue::from(failed));
            row.insert("skipped".to_string(), JsonValue::from(skipped));
            for key in ["start", "id", "jobId", "status", "indexStatus", "jobName", "type", "subPolicyType"] {
                row.insert(key.to_string(), session.get(key).cloned().unwrap_or(JsonValue::Null));
            }
            stats_rows.push(row);
        }
    }
    (sessions, stats_rows)
}

/// Replaces the literal strings `"null"`/`"null(null)"` sometimes returned
/// by the job-log API with a real JSON null, so they drop out of the
/// insert rather than being written as a quoted string field.
fn scrub_null_strings(row: &mut Map<String, JsonValue>) {
    for value in row.values_mut() {
        if matches!(value.as_str(), Some("null") | Some("null(null)")) {
            *value = JsonValue::Null;
        }
    }
}

/// Normalizes a millisecond- or nanosecond-precision timestamp down to
/// whole seconds by repeated division, matching the truncation used
/// throughout the ingestion pipeline's own epoch handling.
fn to_epoch_secs(timestamp: i64) -> i64 {
    let mut n = timestamp;
    while n.abs() >= 99_999_999_999 {
        n /= 1000;
    }
    n
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Turns a `SHOW`/`SELECT`-style single-series JSON response into a list of
/// column-named row maps.
fn rows_as_maps(result: &JsonValue) -> Vec<Map<String, JsonValue>> {
    let Some(series) = result.pointer("/results/0/series/0") else { return Vec::new() };
    let Some(columns) = series.get("columns").and_then(JsonValue::as_array) else { return Vec::new() };
    let Some(values) = series.get("values").and_then(JsonValue::as_array) else { return Vec::new() };

    values
        .iter()
        .filter_map(|row| {
            let cols = row.as_array()?;
            let mut map = Map::new();
            for (col, val) in columns.iter().zip(cols.iter()) {
                if let Some(name) = col.as_str() {
                    map.insert(name.to_string(), val.clone());
                }
            }
            Some(map)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_types_full_detail_includes_all_five() {
        assert_eq!(log_types(true).len(), 5);
    }

    #[test]
    fn log_types_reduced_is_summary_only() {
        assert_eq!(log_types(false), vec!["SUMMARY".to_string()]);
    }

    #[test]
    fn rows_as_maps_zips_columns_and_values() {
        let result = serde_json::json!({
            "results": [{"series": [{"columns": ["time", "id", "jobName"], "values": [[1, 42, "backup"]]}]}]
        });
        let rows = rows_as_maps(&result);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id").unwrap(), 42);
        assert_eq!(rows[0].get("jobName").unwrap(), "backup");
    }

    #[test]
    fn rows_as_maps_returns_empty_for_missing_series() {
        let result = serde_json::json!({"results": [{}]});
        assert!(rows_as_maps(&result).is_empty());
    }

    #[test]
    fn extract_statistics_splits_out_one_row_per_resource_type() {
        let mut session = Map::new();
        session.insert("id".to_string(), JsonValue::from(1));
        session.insert("jobId".to_string(), JsonValue::from("J1"));
        session.insert("start".to_string(), JsonValue::from(1_700_000_000_i64));
        session.insert(
            "properties.statistics".to_string(),
            serde_json::json!([{"resourceType": "vm", "total": 10, "success": 8, "failed": 1}]),
        );

        let (cleaned, stats) = extract_statistics(vec![session]);
        assert!(!cleaned[0].contains_key("properties.statistics"));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].get("skipped").unwrap(), 1);
    }

    #[test]
    fn scrub_null_strings_clears_placeholder_values() {
        let mut row = Map::new();
        row.insert("a".to_string(), JsonValue::from("null"));
        row.insert("b".to_string(), JsonValue::from("null(null)"));
        row.insert("c".to_string(), JsonValue::from("keep me"));
        scrub_null_strings(&mut row);
        assert!(row.get("a").unwrap().is_null());
        assert!(row.get("b").unwrap().is_null());
        assert_eq!(row.get("c").unwrap(), "keep me");
    }

    #[test]
    fn to_epoch_secs_truncates_millisecond_precision() {
        assert_eq!(to_epoch_secs(1_700_000_000_123), 1_700_000_000);
    }

    #[test]
    fn enrich_logs_renames_id_fields_and_injects_session_context() {
        let mut session = Map::new();
        session.insert("jobId".to_string(), JsonValue::from("J1"));
        session.insert("jobName".to_string(), JsonValue::from("nightly"));
        session.insert("start".to_string(), JsonValue::from(1_700_000_000_i64));

        let mut log = Map::new();
        log.insert("id".to_string(), JsonValue::from(5));
        log.insert("jobsessionId".to_string(), JsonValue::from(9));

        let enriched = enrich_logs(vec![log], &session);
        assert_eq!(enriched[0].get("jobLogId").unwrap(), 5);
        assert_eq!(enriched[0].get("jobSessionId").unwrap(), 9);
        assert_eq!(enriched[0].get("jobId").unwrap(), "J1");
    }
}
