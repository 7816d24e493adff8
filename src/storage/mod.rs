//! TSDB HTTP client (component D): database/RP/CQ lifecycle management,
//! line-protocol writes with partial-write error classification, and a
//! structured (not regex-based) `copy_database` that rewrites continuous
//! queries against their own AST rather than pattern-matching rendered
//! query strings.

use crate::error::StorageError;
use crate::query::{ContinuousQuery, SelectionQuery};
use crate::schema::{Catalog, RetentionPolicy, Table};
use crate::time_literal::TimeLiteral;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `copy_database` issues long-running `SELECT ... INTO` statements that can
/// run well past a normal request timeout; the copy path swaps in a client
/// with this much longer timeout for its duration.
const COPY_DATABASE_TIMEOUT: Duration = Duration::from_secs(7200);

/// Outcome of classifying a failed write response, mirroring the
/// substring-based error classification the wire protocol requires (the
/// HTTP API reports partial writes as a message, not a structured field).
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Fewer than `batch_size` points were dropped beyond retention — lost
    /// data is unavoidable and not actionable, so this is not an error.
    Ignored,
    /// Some points failed to parse; the rest of the batch was written.
    PartialParse(String),
    /// A genuine client/server/connection error; retryable with a smaller
    /// batch via the fallback path.
    Retryable(String),
}

/// Classifies a write failure response body against the batch size that was
/// sent. `dropped == batch_size` (every point rejected) and any drop count
/// of exactly 10000 are never "ignorable" — the former means nothing made
/// it in, the latter is the protocol's hard truncation ceiling where
/// **all** excess data silently vanishes.
pub fn classify_write_error(body: &str, batch_size: usize) -> WriteOutcome {
    if let Some(dropped) = extract_dropped_count(body) {
        if dropped < batch_size && dropped != 10_000 {
            return WriteOutcome::Ignored;
        }
    }
    if body.contains("unable to parse") {
        return WriteOutcome::PartialParse(body.to_string());
    }
    WriteOutcome::Retryable(body.to_string())
}

fn extract_dropped_count(body: &str) -> Option<usize> {
    let marker = "dropped=";
    let start = body.find(marker)? + marker.len();
    let digits: String = body[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Thin wrapper over the TSDB's HTTP write/query endpoints.
pub struct StorageClient {
    http: reqwest::Client,
    base_url: String,
    database: String,
}

impl StorageClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            database: database.into(),
        }
    }

    /// Idempotent: creates the database if it doesn't exist yet, then
    /// grants the read-only reporting user access if that account exists
    /// (a missing reporting account is a warning, not a failure — the
    /// ingestion pipeline does not own user provisioning).
    pub async fn setup_database(&self, grafana_reader: &str) -> Result<(), StorageError> {
        let existing = self.query("SHOW DATABASES").await?;
        let already_exists = existing.pointer("/results/0/series/0/values").and_then(JsonValue::as_array).map(|rows| rows.iter().any(|row| row.get(0).and_then(JsonValue::as_str) == Some(&self.database))).unwrap_or(false);
        if already_exists {
            debug!(database = %self.database, "database already exists");
            return Ok(());
        }

        self.query(&format!("CREATE DATABASE {}", self.database)).await?;
        info!(database = %self.database, "created database");

        let users = self.query("SHOW USERS").await?;
        let reader_exists = users.pointer("/results/0/series/0/values").and_then(JsonValue::as_array).map(|rows| rows.iter().any(|row| row.get(0).and_then(JsonValue::as_str) == Some(grafana_reader))).unwrap_or(false);
        if !reader_exists {
            warn!(user = grafana_reader, "reporting user does not exist, skipping grant");
            return Ok(());
        }
        self.query(&format!("GRANT READ ON {} TO {}", self.database, grafana_reader)).await?;
        info!(user = grafana_reader, database = %self.database, "granted read privileges");
        Ok(())
    }

    pub async fn create_retention_policy(&self, rp: &RetentionPolicy) -> Result<(), StorageError> {
        let default_clause = if rp.default { " DEFAULT" } else { "" };
        let q = format!("CREATE RETENTION POLICY {} ON {} DURATION {} REPLICATION {}{}", rp.name, self.database, rp.duration, rp.replication, default_clause);
        self.query(&q).await.map(|_| ())
    }

    pub async fn alter_retention_policy(&self, rp: &RetentionPolicy) -> Result<(), StorageError> {
        let default_clause = if rp.default { " DEFAULT" } else { "" };
        let q = format!("ALTER RETENTION POLICY {} ON {} DURATION {} REPLICATION {}{}", rp.name, self.database, rp.duration, rp.replication, default_clause);
        self.query(&q).await.map(|_| ())
    }

    /// Fetches the live retention policies for `database`, keyed by name,
    /// mapped to a fingerprint comparable with [`Catalog::diff_retention_policies`].
    pub async fn show_retention_policies(&self, database: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let response = self.query(&format!("SHOW RETENTION POLICIES ON {database}")).await?;
        let mut out = BTreeMap::new();
        if let Some(rows) = response.pointer("/results/0/series/0/values").and_then(JsonValue::as_array) {
            for row in rows {
                let Some(cols) = row.as_array() else { continue };
                let (Some(name), Some(duration), Some(replication), Some(default)) = (cols.first().and_then(JsonValue::as_str), cols.get(1).and_then(JsonValue::as_str), cols.get(2).and_then(JsonValue::as_u64), cols.get(4).and_then(JsonValue::as_bool)) else {
                    continue;
                };
                out.insert(name.to_string(), format!("{duration}:{replication}:{default}:"));
            }
        }
        Ok(out)
    }

    pub async fn show_continuous_queries(&self, database: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let response = self.query("SHOW CONTINUOUS QUERIES").await?;
        let mut out = BTreeMap::new();
        if let Some(series) = response.pointer("/results/0/series").and_then(JsonValue::as_array) {
            for entry in series {
                if entry.get("name").and_then(JsonValue::as_str) != Some(database) {
                    continue;
                }
                if let Some(rows) = entry.get("values").and_then(JsonValue::as_array) {
                    for row in rows {
                        let Some(cols) = row.as_array() else { continue };
                        let (Some(name), Some(query)) = (cols.first().and_then(JsonValue::as_str), cols.get(1).and_then(JsonValue::as_str)) else {
                            continue;
                        };
                        out.insert(name.to_string(), query.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Reconciles `catalog`'s declared retention policies and continuous
    /// queries against what the live database reports: missing RPs are
    /// created, drifted ones altered; missing CQs are created, drifted ones
    /// dropped then recreated (no in-place CQ alter exists on the wire).
    pub async fn reconcile(&self, catalog: &Catalog) -> Result<(), StorageError> {
        catalog.validate().map_err(|e| StorageError::Server { status: 0, body: e.to_string() })?;

        let existing_rps = self.show_retention_policies(&catalog.database.name).await?;
        let (add_rps, alter_rps) = catalog.diff_retention_policies(&existing_rps);
        for rp in add_rps {
            self.create_retention_policy(rp).await?;
        }
        for rp in alter_rps {
            self.alter_retention_policy(rp).await?;
        }

        let existing_cqs = self.show_continuous_queries(&catalog.database.name).await?;
        let (drop_cqs, add_cqs) = catalog.diff_continuous_queries(&existing_cqs);
        for name in drop_cqs {
            self.query(&format!("DROP CONTINUOUS QUERY {name} ON {}", catalog.database.name)).await?;
        }
        for cq in add_cqs {
            self.query(&cq.to_query()).await?;
        }
        Ok(())
    }

    /// Writes line-protocol `lines` into `retention_policy`, returning the
    /// classified outcome on partial failure rather than raising — the
    /// write buffer (component E) decides whether to retry with a smaller
    /// batch or drop the error into the run's error list.
    pub async fn write_lines(&self, retention_policy: &str, lines: &[String]) -> Result<(), WriteOutcome> {
        if lines.is_empty() {
            return Ok(());
        }
        let url = format!("{}/write?db={}&rp={}&precision=s", self.base_url, self.database, retention_policy);
        let body = lines.join("\n");
        let response = self.http.post(&url).body(body).send().await.map_err(|e| WriteOutcome::Retryable(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() >= 500 {
            return Err(WriteOutcome::Retryable(text));
        }
        Err(classify_write_error(&text, lines.len()))
    }

    /// Runs a query (InfluxQL `SELECT`/`DELETE`/admin statement) against the
    /// database and returns the parsed JSON response body.
    pub async fn query(&self, q: &str) -> Result<JsonValue, StorageError> {
        let url = format!("{}/query", self.base_url);
        let response = self.http.get(&url).query(&[("db", self.database.as_str()), ("q", q), ("epoch", "s")]).send().await.map_err(|e| StorageError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Server { status: status.as_u16(), body });
        }
        response.json::<JsonValue>().await.map_err(|e| StorageError::Transport(e.to_string()))
    }

    pub async fn send_selection_query(&self, query: &SelectionQuery) -> Result<JsonValue, StorageError> {
        let rendered = query.to_query().map_err(|e| StorageError::Server { status: 0, body: e.to_string() })?;
        self.query(&rendered).await
    }

    /// Copies every table and continuous query into `new_database_name`,
    /// rewriting each CQ structurally (new `INTO` database, and a
    /// retention-bounded `WHERE` clause added so the copy doesn't silently
    /// truncate at the 10000-row partial-write ceiling) instead of
    /// regex-matching the rendered query text.
    pub async fn copy_database(&self, catalog: &Catalog, new_database_name: &str) -> Result<(), StorageError> {
        info!(from = %catalog.database.name, to = new_database_name, "copying database");
        let long = self.with_extended_timeout()?;
        long.setup_database_for_copy(new_database_name).await?;

        let existing_rps = long.show_retention_policies(new_database_name).await?;
        let (add_rps, _) = catalog.diff_retention_policies(&existing_rps);
        for rp in add_rps {
            long.create_retention_policy_in(rp, new_database_name).await?;
        }

        let mut critical_drops = 0usize;
        for table in catalog.database.tables.values() {
            for query in copy_table_queries(table, new_database_name) {
                match long.query(&query).await {
                    Ok(_) => {}
                    Err(StorageError::Server { body, .. }) if body.contains("dropped=10000") => {
                        critical_drops += 1;
                        warn!(%query, "critical drop copying table, retry manually with a shorter WHERE clause");
                    }
                    Err(StorageError::Server { body, .. }) if body.contains("dropped=") => {
                        debug!(%query, "partial drop due to retention policy, acceptable");
                    }
                    Err(e) => {
                        critical_drops += 1;
                        warn!(%query, error = %e, "failed copying table");
                    }
                }
            }
        }

        for cq in &catalog.database.continuous_queries {
            for query in copy_continuous_query(cq, new_database_name) {
                match long.query(&query).await {
                    Ok(_) => {}
                    Err(StorageError::Server { body, .. }) if body.contains("dropped=10000") => {
                        critical_drops += 1;
                        warn!(%query, "critical drop copying continuous query");
                    }
                    Err(StorageError::Server { body, .. }) if body.contains("dropped=") => {}
                    Err(e) => {
                        critical_drops += 1;
                        warn!(%query, error = %e, "failed copying continuous query");
                    }
                }
            }
        }

        if critical_drops > 0 {
            return Err(StorageError::CopyCriticalDrop(format!("{critical_drops} statement(s) produced a critical drop, see logs")));
        }
        Ok(())
    }

    /// Builds a client identical to this one except for a much longer
    /// request timeout, scoped to the lifetime of one `copy_database` call.
    fn with_extended_timeout(&self) -> Result<StorageClient, StorageError> {
        let http = reqwest::Client::builder().timeout(COPY_DATABASE_TIMEOUT).build().map_err(|e| StorageError::Transport(e.to_string()))?;
        Ok(StorageClient {
            http,
            base_url: self.base_url.clone(),
            database: self.database.clone(),
        })
    }

    async fn setup_database_for_copy(&self, database: &str) -> Result<(), StorageError> {
        let existing = self.query("SHOW DATABASES").await?;
        let already_exists = existing.pointer("/results/0/series/0/values").and_then(JsonValue::as_array).map(|rows| rows.iter().any(|row| row.get(0).and_then(JsonValue::as_str) == Some(database))).unwrap_or(false);
        if !already_exists {
            self.query(&format!("CREATE DATABASE {database}")).await?;
        }
        Ok(())
    }

    async fn create_retention_policy_in(&self, rp: &RetentionPolicy, database: &str) -> Result<(), StorageError> {
        let default_clause = if rp.default { " DEFAULT" } else { "" };
        let q = format!("CREATE RETENTION POLICY {} ON {} DURATION {} REPLICATION {}{}", rp.name, database, rp.duration, rp.replication, default_clause);
        self.query(&q).await.map(|_| ())
    }
}

/// Builds the two `SELECT ... INTO` statements that copy one table's data
/// into `new_database_name`: one sourced from `autogen` (data inserted
/// before any retention policy existed), one from the table's own RP.
fn copy_table_queries(table: &Arc<Table>, new_database_name: &str) -> Vec<String> {
    let duration = &table.retention_policy.duration;
    vec![
        format!("SELECT * INTO {new_database_name}.{}.{} FROM autogen.{} WHERE time > now() - {duration} GROUP BY *", table.retention_policy.name, table.name, table.name),
        format!("SELECT * INTO {new_database_name}.{}.{} FROM {} WHERE time > now() - {duration} GROUP BY *", table.retention_policy.name, table.name, table),
    ]
}

/// Rewrites a continuous query's `SELECT INTO` against its own AST rather
/// than pattern-matching the rendered query string: swaps the source
/// retention policy, adds a retention-bounded `WHERE` clause so the copy
/// can't silently truncate, and emits one variant per source retention
/// policy (the declared one, and `autogen` for data written before any RP
/// existed). The `INTO` clause's database is qualified as a final string
/// step, since `Table`'s `Display` only ever carries an RP-qualified name
/// within the process's single scoped database.
fn copy_continuous_query(cq: &ContinuousQuery, new_database_name: &str) -> Vec<String> {
    let Some(select) = cq.select_query() else { return vec![] };
    let Some(into_table) = select.into_table_ref() else {
        warn!(cq = %cq.name, "continuous query has no INTO table, skipping copy");
        return vec![];
    };

    let retention_clause = match &into_table.retention_policy.duration {
        TimeLiteral::Infinite => None,
        duration => Some(format!("time > now() - {duration}")),
    };

    let source_rp_name = select.source_table().map(|t| t.retention_policy.name.clone()).unwrap_or_else(|| "autogen".to_string());

    let mut variants = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for source_rp in [source_rp_name, "autogen".to_string()] {
        if !seen.insert(source_rp.clone()) {
            continue;
        }
        let mut rewritten = select.clone().alt_rp(Arc::new(RetentionPolicy::new(source_rp, TimeLiteral::Infinite)));
        if let Some(clause) = &retention_clause {
            let merged = match rewritten.where_clause_ref() {
                Some(existing) if !existing.is_empty() => format!("{existing} AND {clause}"),
                _ => clause.clone(),
            };
            rewritten = rewritten.where_clause(merged);
        }
        let Ok(rendered) = rewritten.to_query() else { continue };
        variants.push(qualify_into_database(&rendered, new_database_name));
    }
    variants
}

/// Inserts `new_database_name` in front of the rendered query's `INTO`
/// target. Safe to do positionally: the query text was just produced by
/// [`crate::query::SelectionQuery::to_query`] in this same function, so its
/// `INTO {rp}.{name}` shape is known exactly, not guessed at.
fn qualify_into_database(rendered: &str, new_database_name: &str) -> String {
    match rendered.find("INTO ") {
        Some(idx) => {
            let after = idx + "INTO ".len();
            format!("{}INTO {new_database_name}.{}", &rendered[..idx], &rendered[after..])
        }
        None => rendered.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_retention_drop_is_ignored() {
        let outcome = classify_write_error("partial write: points beyond retention policy dropped=3", 500);
        assert_eq!(outcome, WriteOutcome::Ignored);
    }

    #[test]
    fn drop_of_exactly_10000_is_never_ignored() {
        let outcome = classify_write_error("partial write: points beyond retention policy dropped=10000", 10_000);
        assert_ne!(outcome, WriteOutcome::Ignored);
    }

    #[test]
    fn unable_to_parse_is_partial_parse_failure() {
        let outcome = classify_write_error("partial write: unable to parse 'bad line': invalid field format", 500);
        assert!(matches!(outcome, WriteOutcome::PartialParse(_)));
    }

    #[test]
    fn unrecognized_client_error_is_retryable() {
        let outcome = classify_write_error("400 Bad Request: malformed query", 500);
        assert!(matches!(outcome, WriteOutcome::Retryable(_)));
    }
}
