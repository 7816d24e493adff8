//! Message-log parser registry (component H): maps a recognized `messageId`
//! to the measurement it feeds and a function that turns the log's
//! positional `messageParams` into field/tag values.
//!
//! This is the only place a specific message's shape is known. Adding a new
//! derived measurement means adding an entry here plus a catalog declaration
//! in [`crate::schema::definitions`] — nothing else in the harvester changes.

use crate::time_literal::parse_unit;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::sync::OnceLock;

/// A field copied from the enclosing (harvester-enriched) log record rather
/// than from `messageParams`, with an optional rename.
pub struct ExtraField {
    pub source: &'static str,
    pub dest: &'static str,
}

const fn copy(name: &'static str) -> ExtraField {
    ExtraField { source: name, dest: name }
}

/// One registered `messageId`'s mapping.
pub struct ParserEntry {
    pub destination: &'static str,
    pub extra_fields: &'static [ExtraField],
    /// `Ok(None)` means the params didn't match this message's expected
    /// shape and the log should be silently skipped (not an error, this
    /// happens often for near-miss log variants). `Err` means the params
    /// were short or malformed in a way that indicates a real mismatch
    /// between this registry entry and the log it was registered for.
    pub map_params: fn(&[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String>,
}

/// Looks up the parser entry for `message_id`, if any. Unknown message IDs
/// are simply not parsed into a derived row.
pub fn lookup(message_id: &str) -> Option<ParserEntry> {
    match message_id {
        "CTGGA2384" => Some(ParserEntry {
            destination: "vmBackupSummary",
            extra_fields: &[copy("messageId")],
            map_params: parse_vm_backup_summary_full,
        }),
        "CTGGA0071" => Some(ParserEntry {
            destination: "vmBackupSummary",
            extra_fields: &[copy("messageId")],
            map_params: parse_vm_backup_summary_brief,
        }),
        "CTGGA0072" => Some(ParserEntry {
            destination: "vmReplicateSummary",
            extra_fields: &[],
            map_params: parse_vm_replicate_summary,
        }),
        "CTGGA0398" => Some(ParserEntry {
            destination: "vmReplicateStats",
            extra_fields: &[],
            map_params: parse_vm_replicate_stats,
        }),
        "CTGGR0003" => Some(ParserEntry {
            destination: "office365Stats",
            extra_fields: &[copy("jobId"), copy("jobSessionId"), copy("jobName"), copy("jobExecutionTime")],
            map_params: parse_office365_users,
        }),
        "CTGGA2444" => Some(ParserEntry {
            destination: "office365Stats",
            extra_fields: &[copy("jobId"), copy("jobSessionId"), copy("jobName"), copy("jobExecutionTime")],
            map_params: parse_office365_items,
        }),
        "CTGGA2402" => Some(ParserEntry {
            destination: "office365TransfBytes",
            extra_fields: &[copy("jobId"), copy("jobSessionId"), copy("jobName")],
            map_params: parse_office365_transfer,
        }),
        _ => None,
    }
}

/// The set of `messageId`s the registry recognizes, used by the harvester
/// to request only relevant logs from the REST API.
pub fn known_ids() -> Vec<&'static str> {
    vec!["CTGGA2384", "CTGGA0071", "CTGGA0072", "CTGGA0398", "CTGGR0003", "CTGGA2444", "CTGGA2402"]
}

fn param_str<'a>(params: &'a [JsonValue], index: usize) -> Option<&'a str> {
    params.get(index).and_then(JsonValue::as_str)
}

fn param_int(params: &[JsonValue], index: usize) -> Option<i64> {
    let value = params.get(index)?;
    value.as_i64().or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
}

fn param_unit(params: &[JsonValue], index: usize) -> Result<f64, String> {
    let raw = param_str(params, index).ok_or_else(|| format!("missing param {index}"))?;
    parse_unit(raw, None, " ").map_err(|e| e.to_string())
}

fn param_unit_delim(params: &[JsonValue], index: usize, delimiter: &str) -> Result<f64, String> {
    let raw = param_str(params, index).ok_or_else(|| format!("missing param {index}"))?;
    parse_unit(raw, None, delimiter).map_err(|e| e.to_string())
}

fn parse_vm_backup_summary_full(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let name = param_str(params, 0).ok_or("missing param 0 (name)")?;
    let proxy = param_str(params, 1).ok_or("missing param 1 (proxy)")?;
    let vsnaps = param_str(params, 2).ok_or("missing param 2 (vsnaps)")?;
    let kind = param_str(params, 3).ok_or("missing param 3 (type)")?;
    let transport_type = param_str(params, 4).ok_or("missing param 4 (transportType)")?;
    let transferred_bytes = param_unit(params, 5)?;
    let throughput = param_unit(params, 6)?;
    let queue_time = param_unit(params, 7)?;
    let protected = param_int(params, 8).ok_or("missing param 8 (protectedVMDKs)")?;
    let total = param_int(params, 9).ok_or("missing param 9 (TotalVMDKs)")?;
    let status = param_str(params, 10).ok_or("missing param 10 (status)")?;

    let mut row = Map::new();
    row.insert("name".to_string(), JsonValue::from(name));
    row.insert("proxy".to_string(), JsonValue::from(proxy));
    row.insert("vsnaps".to_string(), JsonValue::from(vsnaps));
    row.insert("type".to_string(), JsonValue::from(kind));
    row.insert("transportType".to_string(), JsonValue::from(transport_type));
    row.insert("transferredBytes".to_string(), JsonValue::from(transferred_bytes as i64));
    row.insert("throughputBytes/s".to_string(), JsonValue::from(throughput as i64));
    row.insert("queueTimeSec".to_string(), JsonValue::from(queue_time as i64));
    row.insert("protectedVMDKs".to_string(), JsonValue::from(protected));
    row.insert("TotalVMDKs".to_string(), JsonValue::from(total));
    row.insert("status".to_string(), JsonValue::from(status));
    Ok(Some(row))
}

fn parse_vm_backup_summary_brief(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let protected = param_int(params, 0).ok_or("missing param 0 (protectedVMDKs)")?;
    let total_delta = param_int(params, 1).ok_or("missing param 1 (TotalVMDKs delta)")?;
    let transferred_bytes = param_unit(params, 2)?;
    let throughput = param_unit(params, 3)?;
    let queue_time = param_unit(params, 4)?;

    let mut row = Map::new();
    row.insert("protectedVMDKs".to_string(), JsonValue::from(protected));
    row.insert("TotalVMDKs".to_string(), JsonValue::from(total_delta + protected));
    row.insert("transferredBytes".to_string(), JsonValue::from(transferred_bytes as i64));
    row.insert("throughputBytes/s".to_string(), JsonValue::from(throughput as i64));
    row.insert("queueTimeSec".to_string(), JsonValue::from(queue_time as i64));
    Ok(Some(row))
}

fn parse_vm_replicate_summary(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let total = param_int(params, 0).ok_or("missing param 0 (total)")?;
    let failed = param_int(params, 1).ok_or("missing param 1 (failed)")?;
    let duration = param_unit(params, 2)?;

    let mut row = Map::new();
    row.insert("total".to_string(), JsonValue::from(total));
    row.insert("failed".to_string(), JsonValue::from(failed));
    row.insert("duration".to_string(), JsonValue::from(duration as i64));
    Ok(Some(row))
}

fn parse_vm_replicate_stats(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let replicated_bytes = param_unit(params, 0)?;
    let throughput = param_unit(params, 1)?;
    let duration = param_unit_delim(params, 2, ":")?;

    let mut row = Map::new();
    row.insert("replicatedBytes".to_string(), JsonValue::from(replicated_bytes as i64));
    row.insert("throughputBytes/sec".to_string(), JsonValue::from(throughput as i64));
    row.insert("duration".to_string(), JsonValue::from(duration as i64));
    Ok(Some(row))
}

fn parse_office365_users(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let imported = param_int(params, 0).ok_or("missing param 0 (imported365Users)")?;
    let mut row = Map::new();
    row.insert("imported365Users".to_string(), JsonValue::from(imported));
    Ok(Some(row))
}

fn parse_office365_items(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let items = param_int(params, 0).ok_or("missing param 0 (protectedItems/selectedItems)")?;
    let mut row = Map::new();
    row.insert("protectedItems".to_string(), JsonValue::from(items));
    row.insert("selectedItems".to_string(), JsonValue::from(items));
    Ok(Some(row))
}

fn office365_transfer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*\(Server:\s*([^\s,]+), Transfer Size: (\d+(?:.\d*)?\s*\w*)\)").unwrap())
}

fn parse_office365_transfer(params: &[JsonValue]) -> Result<Option<Map<String, JsonValue>>, String> {
    let item_name = param_str(params, 0).ok_or("missing param 0 (itemName)")?;
    let raw = param_str(params, 1).ok_or("missing param 1 (transfer description)")?;

    let Some(captures) = office365_transfer_regex().captures(raw) else {
        // Shape didn't match, likely a different variant of this message. Not an error.
        return Ok(None);
    };
    let item_type = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    let server_name = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
    let size_token = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
    let transferred_bytes = parse_unit(size_token, None, " ").map_err(|e| e.to_string())?;

    let mut row = Map::new();
    row.insert("itemName".to_string(), JsonValue::from(item_name));
    row.insert("itemType".to_string(), JsonValue::from(item_type));
    row.insert("serverName".to_string(), JsonValue::from(server_name));
    row.insert("transferredBytes".to_string(), JsonValue::from(transferred_bytes as i64));
    Ok(Some(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(values: &[&str]) -> Vec<JsonValue> {
        values.iter().map(|v| JsonValue::from(*v)).collect()
    }

    #[test]
    fn unknown_message_id_is_not_registered() {
        assert!(lookup("CTGGX9999").is_none());
    }

    #[test]
    fn vm_backup_summary_full_maps_eleven_positional_params() {
        let entry = lookup("CTGGA2384").unwrap();
        let row = (entry.map_params)(&params(&["vm1", "proxy1", "2", "INCR", "NBD", "1.5GB", "50MB/s", "3s", "4", "5", "DONE"])).unwrap().unwrap();
        assert_eq!(row.get("name").unwrap(), "vm1");
        assert_eq!(row.get("status").unwrap(), "DONE");
        assert!(row.get("transferredBytes").unwrap().is_i64());
    }

    #[test]
    fn vm_backup_summary_brief_adds_delta_to_protected_count() {
        let entry = lookup("CTGGA0071").unwrap();
        let row = (entry.map_params)(&params(&["4", "1", "1GB", "10MB/s", "2s"])).unwrap().unwrap();
        assert_eq!(row.get("protectedVMDKs").unwrap(), 4);
        assert_eq!(row.get("TotalVMDKs").unwrap(), 5);
    }

    #[test]
    fn vm_replicate_stats_parses_colon_delimited_duration() {
        let entry = lookup("CTGGA0398").unwrap();
        let row = (entry.map_params)(&params(&["1GB", "10MB/s", "0:01:30"])).unwrap().unwrap();
        assert!(row.get("duration").unwrap().as_i64().unwrap() > 0);
    }

    #[test]
    fn office365_transfer_extracts_server_and_size_from_regex() {
        let entry = lookup("CTGGA2402").unwrap();
        let row = (entry.map_params)(&params(&["item1", "Upload (Server: mail01, Transfer Size: 12.5MB)"])).unwrap().unwrap();
        assert_eq!(row.get("itemType").unwrap(), "Upload");
        assert_eq!(row.get("serverName").unwrap(), "mail01");
        assert_eq!(row.get("transferredBytes").unwrap().as_i64().unwrap(), 12_500_000);
    }

    #[test]
    fn office365_transfer_returns_none_on_shape_mismatch() {
        let entry = lookup("CTGGA2402").unwrap();
        let result = (entry.map_params)(&params(&["item1", "this does not match the expected shape"])).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn missing_param_is_reported_as_error_not_silent_skip() {
        let entry = lookup("CTGGA0072").unwrap();
        let err = (entry.map_params)(&params(&["1"])).unwrap_err();
        assert!(err.contains("missing param"));
    }
}
