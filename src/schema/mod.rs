//! Schema catalog (component C): declared measurements, retention policies,
//! and continuous queries, plus reconciliation against a live database's
//! current state.
//!
//! Retention policies and continuous queries are declared once per database
//! and shared across tables; CQ templates are closures taken over a `Table`
//! that does not exist yet at declaration time, mirroring the deferred
//! registration used by the seed set in [`definitions`].

pub mod definitions;

use crate::error::SchemaError;
use crate::query::{ContinuousQuery, Keyword, SelectionQuery};
use crate::time_literal::TimeLiteral;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Field datatype. Determines how [`crate::query::InsertQuery`] formats a
/// value: strings are quoted and escaped, timestamps become epoch seconds
/// with an `i` suffix, ints get an `i` suffix, floats and bools are written
/// bare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Datatype {
    Float,
    Int,
    Bool,
    String,
    Timestamp,
}

impl Datatype {
    /// Best-effort datatype for a value with no declared field, mirroring
    /// the fallback used when a key has no entry in the table's field map.
    pub fn auto_detect(value: &JsonValue) -> Datatype {
        match value {
            JsonValue::Bool(_) => Datatype::Bool,
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => Datatype::Int,
            JsonValue::Number(_) => Datatype::Float,
            _ => Datatype::String,
        }
    }
}

/// A named retention duration on a database.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub name: String,
    pub duration: TimeLiteral,
    pub replication: u32,
    pub default: bool,
    pub shard_duration: Option<TimeLiteral>,
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>, duration: TimeLiteral) -> Self {
        Self {
            name: name.into(),
            duration,
            replication: 1,
            default: false,
            shard_duration: None,
        }
    }

    pub fn default_policy(mut self) -> Self {
        self.default = true;
        self
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Factory for the retention-policy tiers used across the seed measurements.
/// Be aware data is kept either for its own duration or for the longest
/// CQ `GROUP BY` window, whichever is larger — dashboards group measurements
/// into 14d/90d/INF tiers accordingly.
pub struct Rp;

impl Rp {
    /// Default autogenerated policy; kept at `INF` so nothing is lost for an
    /// undeclared measurement.
    pub fn autogen() -> RetentionPolicy {
        RetentionPolicy::new("autogen", TimeLiteral::Infinite)
    }

    /// A bare `inf` literal is an invalid numeric literal in the TSDB's
    /// query language, so this still renders as `INF`.
    pub fn inf() -> RetentionPolicy {
        RetentionPolicy::new("rp_inf", TimeLiteral::Infinite)
    }

    pub fn year() -> RetentionPolicy {
        RetentionPolicy::new("rp_year", TimeLiteral::parse("56w").unwrap())
    }

    pub fn half_year() -> RetentionPolicy {
        RetentionPolicy::new("rp_half_year", TimeLiteral::parse("28w").unwrap())
    }

    pub fn days_90() -> RetentionPolicy {
        RetentionPolicy::new("rp_days_90", TimeLiteral::parse("90d").unwrap())
    }

    pub fn days_14() -> RetentionPolicy {
        RetentionPolicy::new("rp_days_14", TimeLiteral::parse("14d").unwrap()).default_policy()
    }

    pub fn days_7() -> RetentionPolicy {
        RetentionPolicy::new("rp_days_7", TimeLiteral::parse("7d").unwrap())
    }
}

/// A declared measurement: field/tag layout, the retention policy it writes
/// into, and the key treated as the point timestamp.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub fields: BTreeMap<String, Datatype>,
    pub tags: Vec<String>,
    pub time_key: String,
    pub retention_policy: Arc<RetentionPolicy>,
}

impl Table {
    pub fn new(name: impl Into<String>, fields: BTreeMap<String, Datatype>, tags: Vec<String>, retention_policy: Arc<RetentionPolicy>) -> Self {
        Self {
            name: name.into(),
            fields,
            tags,
            time_key: "time".to_string(),
            retention_policy,
        }
    }

    pub fn with_time_key(mut self, time_key: impl Into<String>) -> Self {
        self.time_key = time_key.into();
        self
    }

    /// Builds a copy of this table pointing at a different retention policy,
    /// used when a single insert overrides the measurement's default RP.
    pub fn with_retention_policy(&self, retention_policy: Arc<RetentionPolicy>) -> Self {
        Self {
            name: self.name.clone(),
            fields: self.fields.clone(),
            tags: self.tags.clone(),
            time_key: self.time_key.clone(),
            retention_policy,
        }
    }

    /// Splits a flat JSON object into `(tags, fields, timestamp)` using this
    /// table's declared layout. Keys not declared as tags or the time key
    /// are treated as fields, auto-detecting their datatype. `None` values
    /// are dropped entirely, matching the TSDB write path's field-skip rule.
    pub fn split_by_table_def(&self, record: &serde_json::Map<String, JsonValue>) -> (BTreeMap<String, JsonValue>, BTreeMap<String, JsonValue>, Option<JsonValue>) {
        let mut tags = BTreeMap::new();
        let mut fields = BTreeMap::new();
        let mut timestamp = None;

        for (key, value) in record {
            if value.is_null() {
                continue;
            }
            if key == &self.time_key {
                timestamp = Some(value.clone());
                continue;
            }
            if self.tags.contains(key) {
                tags.insert(key.clone(), value.clone());
            } else {
                fields.insert(key.clone(), value.clone());
            }
        }
        (tags, fields, timestamp)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.retention_policy.name, self.name)
    }
}

/// A deferred continuous-query template: the table instance it downsamples
/// does not exist yet at declaration time, so templates are closures
/// applied once the table is registered (see [`Catalog::declare_measurement`]).
pub type CqTemplate = Arc<dyn Fn(&Arc<Table>, &str, &str) -> ContinuousQuery + Send + Sync>;

/// Template matching the TSDB's `GROUP BY time(...), *` downsampling idiom:
/// aggregates `fields` from `table` into `new_retention_policy`.
pub fn cq_downsample(fields: Vec<String>, new_retention_policy: Arc<RetentionPolicy>, group_time: &'static str, group_args: Vec<String>) -> CqTemplate {
    let group_time = group_time.to_string();
    Arc::new(move |table: &Arc<Table>, name: &str, database_name: &str| {
        let into_table = Arc::new(table.with_retention_policy(new_retention_policy.clone()));
        let mut group_list = vec![format!("time({group_time})")];
        group_list.extend(group_args.iter().cloned());
        let select_query = SelectionQuery::new(Keyword::Select, Arc::new(table.as_ref().clone()))
            .into_table(into_table)
            .fields(fields.clone())
            .group_by(group_list);
        ContinuousQuery::new(name, database_name, select_query).for_interval(TimeLiteral::parse("1w").unwrap())
    })
}

/// A named database: declared tables, the set of retention policies any
/// table references, and the continuous queries derived from them.
#[derive(Default)]
pub struct Database {
    pub name: String,
    pub tables: BTreeMap<String, Arc<Table>>,
    pub retention_policies: BTreeMap<String, Arc<RetentionPolicy>>,
    pub continuous_queries: Vec<ContinuousQuery>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn table(&self, name: &str) -> Result<&Arc<Table>, SchemaError> {
        self.tables.get(name).ok_or_else(|| SchemaError::UnknownMeasurement(name.to_string()))
    }
}

/// Declares measurements into a [`Database`] and reconciles that declaration
/// against whatever a live TSDB reports: missing retention policies and
/// continuous queries are added, stale ones are altered or dropped and
/// re-added (no in-place CQ alter exists).
pub struct Catalog {
    pub database: Database,
}

impl Catalog {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self { database: Database::new(database_name) }
    }

    /// Declares one measurement, instantiating any CQ templates now that a
    /// `Table` instance is available, and generating default CQ names
    /// `cq_{table}_{i}` for templated entries.
    pub fn declare_measurement(
        &mut self,
        name: &str,
        fields: BTreeMap<String, Datatype>,
        tags: Vec<String>,
        time_key: Option<&str>,
        retention_policy: RetentionPolicy,
        continuous_queries: Vec<CqTemplate>,
    ) -> Result<(), SchemaError> {
        let rp = Arc::new(retention_policy);
        self.database.retention_policies.insert(rp.name.clone(), rp.clone());

        let mut table = Table::new(name, fields, tags, rp.clone());
        if let Some(time_key) = time_key {
            table = table.with_time_key(time_key);
        }
        let table = Arc::new(table);
        self.database.tables.insert(name.to_string(), table.clone());

        for (i, template) in continuous_queries.into_iter().enumerate() {
            let cq = template(&table, &format!("cq_{}_{}", table.name, i), &self.database.name);
            if let Some(into_table) = cq.select_query().and_then(|q| q.into_table_ref()) {
                self.database.retention_policies.insert(into_table.retention_policy.name.clone(), into_table.retention_policy.clone());
            }
            self.database.continuous_queries.push(cq);
        }
        Ok(())
    }

    /// Validates at most one retention policy is marked default, per
    /// measurement of the TSDB error raised on ambiguous defaults.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let default_count = self.database.retention_policies.values().filter(|rp| rp.default).count();
        if default_count > 1 {
            return Err(SchemaError::MultipleDefaultRps(self.database.name.clone()));
        }
        Ok(())
    }

    /// Computes which retention policies must be added or altered to match
    /// `existing` (name -> rendered definition reported by the live TSDB).
    /// Returns `(to_add, to_alter)`.
    pub fn diff_retention_policies<'a>(&'a self, existing: &BTreeMap<String, String>) -> (Vec<&'a RetentionPolicy>, Vec<&'a RetentionPolicy>) {
        let mut add = Vec::new();
        let mut alter = Vec::new();
        for rp in self.database.retention_policies.values() {
            match existing.get(&rp.name) {
                None => add.push(rp.as_ref()),
                Some(rendered) if rendered != &rp_fingerprint(rp) => alter.push(rp.as_ref()),
                Some(_) => {}
            }
        }
        (add, alter)
    }

    /// Computes which continuous queries must be dropped (name only, no
    /// alter exists) and which must be (re-)added, comparing rendered query
    /// text against what the live TSDB reports.
    pub fn diff_continuous_queries<'a>(&'a self, existing: &BTreeMap<String, String>) -> (Vec<String>, Vec<&'a ContinuousQuery>) {
        let mut drop = Vec::new();
        let mut add = Vec::new();
        for cq in &self.database.continuous_queries {
            match existing.get(&cq.name) {
                None => add.push(cq),
                Some(rendered) if rendered != &cq.to_query() => {
                    drop.push(cq.name.clone());
                    add.push(cq);
                }
                Some(_) => {}
            }
        }
        (drop, add)
    }
}

/// A stable fingerprint of an RP's externally-visible definition, used to
/// detect drift without needing the live TSDB's exact wire representation.
fn rp_fingerprint(rp: &RetentionPolicy) -> String {
    format!("{}:{}:{}:{}", rp.duration, rp.replication, rp.default, rp.shard_duration.as_ref().map(|s| s.to_string()).unwrap_or_default())
}
