//! REST paginator (component F): a pageable fetcher over a session-
//! authenticated HTTPS API, with adaptive page sizing tuned to keep each
//! request's send time near a configured target.
//!
//! Page-size arithmetic is split into pure functions so it can be tested
//! without a network; [`RestClient`] wires them into the actual request
//! loop, following `links.nextPage.href` until the API stops returning one.

use crate::buffer::WriteBuffer;
use crate::error::PaginatorError;
use crate::query::Keyword;
use crate::schema::Table;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tunable parameters for one connection profile. The REST API exposes a
/// "normal" and a "loaded-system" variant with different timeouts and
/// page-size aggressiveness.
#[derive(Debug, Clone, Copy)]
pub struct PaginatorProfile {
    pub initial_connect_timeout: Duration,
    pub request_timeout: Duration,
    pub preferred_send_time: f64,
    pub max_scaling_factor: f64,
    pub allowed_send_delta: f64,
    pub timeout_reduction: f64,
    pub max_send_retries: u32,
    pub starting_page_size: u32,
    pub min_page_size: u32,
}

impl PaginatorProfile {
    pub fn normal() -> Self {
        Self {
            initial_connect_timeout: Duration::from_millis(6050),
            request_timeout: Duration::from_secs(60),
            preferred_send_time: 30.0,
            max_scaling_factor: 3.5,
            allowed_send_delta: 0.10,
            timeout_reduction: 0.70,
            max_send_retries: 3,
            starting_page_size: 50,
            min_page_size: 5,
        }
    }

    pub fn loaded() -> Self {
        Self {
            initial_connect_timeout: Duration::from_millis(6050),
            request_timeout: Duration::from_secs(360),
            preferred_send_time: 20.0,
            max_scaling_factor: 3.5,
            allowed_send_delta: 0.10,
            timeout_reduction: 0.95,
            max_send_retries: 1,
            starting_page_size: 10,
            min_page_size: 1,
        }
    }
}

/// Recomputes the page size after a completed (non-timeout) request.
/// Leaves `page_size` untouched unless it deviates from `preferred_time` by
/// more than `allowed_send_delta`, growing or shrinking toward the
/// preferred rate and clamping to `[min_page_size + 5, max_scaling_factor *
/// (page_size + 5)]`.
pub fn adjust_page_size_for_send_time(page_size: u32, min_page_size: u32, preferred_time: f64, send_time: f64, allowed_send_delta: f64, max_scaling_factor: f64) -> u32 {
    let time_difference_quota = send_time / preferred_time;
    if (time_difference_quota - 1.0).abs() <= allowed_send_delta {
        return page_size;
    }

    let mut new_page_size = (page_size as f64 / time_difference_quota) as u32;
    let max_allowed = (max_scaling_factor * (page_size as f64 + 5.0)) as u32;
    if new_page_size > max_allowed {
        new_page_size = max_allowed;
    }
    if new_page_size < min_page_size + 5 {
        new_page_size = min_page_size + 5;
    }
    new_page_size
}

/// Reduces the page size after a read timeout by `timeout_reduction`,
/// floored implicitly by the caller forcing `min_page_size` on the last try.
pub fn adjust_page_size_for_timeout(page_size: u32, min_page_size: u32, timeout_reduction: f64) -> u32 {
    let size_over_limit = page_size.saturating_sub(min_page_size) as f64;
    (page_size as f64 - size_over_limit * timeout_reduction) as u32
}

/// Flattens `record`'s nested objects into dot-qualified keys (e.g.
/// `"properties.statistics"`), then keeps only `allow_list` keys if given,
/// else everything but `ignore_list` keys.
pub fn filter_record(record: &Map<String, JsonValue>, allow_list: Option<&[&str]>, ignore_list: Option<&[&str]>) -> Map<String, JsonValue> {
    let mut out = Map::new();

    if let Some(allow_list) = allow_list {
        for key in allow_list {
            if let Some(value) = get_nested(record, key) {
                out.insert((*key).to_string(), value);
            }
        }
        if out.len() != allow_list.len() {
            warn!(missing = allow_list.len() - out.len(), "result missing some allow_list keys, probably a typo");
        }
        return out;
    }

    let ignore: BTreeSet<&str> = ignore_list.unwrap_or(&[]).iter().copied().collect();
    flatten_with_sub_values(record, "", &ignore, &mut out);
    out
}

fn get_nested(record: &Map<String, JsonValue>, dotted_key: &str) -> Option<JsonValue> {
    let mut current: &JsonValue = &JsonValue::Object(record.clone());
    for part in dotted_key.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn flatten_with_sub_values(record: &Map<String, JsonValue>, prefix: &str, ignore: &BTreeSet<&str>, out: &mut Map<String, JsonValue>) {
    for (key, value) in record {
        if ignore.contains(key.as_str()) {
            continue;
        }
        let qualified = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        if let JsonValue::Object(nested) = value {
            flatten_with_sub_values(nested, &qualified, ignore, out);
        } else {
            out.insert(qualified, value.clone());
        }
    }
}

/// HTTP verb used for a paginated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Get,
    Post,
}

/// A session-authenticated client against the REST API, adapting its page
/// size per [`PaginatorProfile`] as it paginates.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    profile: PaginatorProfile,
    session_id: Mutex<Option<String>>,
    page_size: Mutex<u32>,
    metrics_sink: Option<(Arc<WriteBuffer>, Arc<Table>)>,
}

impl RestClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>, profile: PaginatorProfile) -> Self {
        let starting_page_size = profile.starting_page_size;
        Self {
            http,
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            profile,
            session_id: Mutex::new(None),
            page_size: Mutex::new(starting_page_size),
            metrics_sink: None,
        }
    }

    pub fn with_metrics_sink(mut self, buffer: Arc<WriteBuffer>, metrics_table: Arc<Table>) -> Self {
        self.metrics_sink = Some((buffer, metrics_table));
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Authenticates and stores the session id used by every later request.
    pub async fn login(&self) -> Result<(), PaginatorError> {
        let url = self.url("/api/endeavour/session");
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.profile.request_timeout)
            .send()
            .await
            .map_err(|e| PaginatorError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PaginatorError::LoginFailed(format!("status {}", response.status())));
        }
        let body: JsonValue = response.json().await.map_err(|e| PaginatorError::Transport(e.to_string()))?;
        let session_id = body.get("sessionid").and_then(JsonValue::as_str).ok_or_else(|| PaginatorError::LoginFailed("no sessionid received".to_string()))?;
        *self.session_id.lock().await = Some(session_id.to_string());
        Ok(())
    }

    /// Logs out; failure here is logged by the caller, not treated as fatal
    /// (matching the REST login/logout asymmetry: login failure aborts, a
    /// logout failure does not).
    pub async fn logout(&self) -> Result<(), PaginatorError> {
        let Some(session_id) = self.session_id.lock().await.clone() else { return Ok(()) };
        let url = self.url("/api/endeavour/session");
        self.http
            .delete(&url)
            .header("X-Endeavour-Sessionid", session_id)
            .send()
            .await
            .map_err(|e| PaginatorError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Fetches every page reachable from `endpoint`, following
    /// `links.nextPage.href`, adapting page size between requests.
    /// `extra_params` seeds the first request (e.g. a `filter` query
    /// parameter); later pages carry whatever the API's own `nextPage` link
    /// echoes back.
    pub async fn get_objects(&self, endpoint: &str, array_name: Option<&str>, allow_list: Option<&[&str]>, ignore_list: Option<&[&str]>, add_time_stamp: bool, extra_params: &[(&str, &str)]) -> Result<Vec<Map<String, JsonValue>>, PaginatorError> {
        let mut results = Vec::new();
        let mut next_page = Some(self.url(endpoint));
        let mut params: Vec<(String, String)> = extra_params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        while let Some(page_url) = next_page {
            let page_size = *self.page_size.lock().await;
            if !params.iter().any(|(k, _)| k == "pageSize") {
                params.push(("pageSize".to_string(), page_size.to_string()));
            }

            let start = Instant::now();
            let response = self.request_with_retry(&page_url, &params, RequestType::Get, None).await?;
            let send_time = start.elapsed().as_secs_f64();

            let page_url_for_metrics = endpoint.to_string();
            self.emit_page_metric(&page_url_for_metrics, send_time).await;

            next_page = response.pointer("/links/nextPage/href").and_then(JsonValue::as_str).map(|s| s.to_string());
            params = match &next_page {
                Some(url) => parse_query_params(url),
                None => Vec::new(),
            };
            if let Some(url) = &next_page {
                next_page = Some(strip_query(url));
            }

            let page_items: Vec<Map<String, JsonValue>> = match array_name {
                Some(name) => {
                    let array = response.get(name).and_then(JsonValue::as_array).ok_or_else(|| PaginatorError::ExpectedArray(name.to_string()))?;
                    array.iter().filter_map(|v| v.as_object().cloned()).collect()
                }
                None => response.as_object().into_iter().cloned().collect(),
            };

            let page_len = page_items.len();
            let mut filtered: Vec<Map<String, JsonValue>> = page_items.iter().map(|record| filter_record(record, allow_list, ignore_list)).collect();

            if add_time_stamp {
                let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
                for record in &mut filtered {
                    record.insert("time".to_string(), JsonValue::from(now));
                }
            }
            results.extend(filtered);

            let full_page = page_len as u32 == page_size;
            if send_time > self.profile.preferred_send_time || full_page {
                let new_size = adjust_page_size_for_send_time(page_size, self.profile.min_page_size, self.profile.preferred_send_time, send_time, self.profile.allowed_send_delta, self.profile.max_scaling_factor);
                debug!(from = page_size, to = new_size, "adjusted page size");
                *self.page_size.lock().await = new_size;
                set_param(&mut params, "pageSize", &new_size.to_string());
            }
        }

        debug!(collected = results.len(), endpoint, "finished paginating endpoint");
        Ok(results)
    }

    async fn emit_page_metric(&self, endpoint: &str, send_time: f64) {
        let Some((buffer, metrics_table)) = &self.metrics_sink else { return };
        if let Err(err) = buffer.record_metric(metrics_table.clone(), Keyword::Select, endpoint, send_time * 1000.0, 1, None).await {
            warn!(error = %err, "failed to record paginator self-metric");
        }
    }

    /// Sends one request, retrying on a read timeout up to
    /// `max_send_retries`, shrinking the page size before each retry and
    /// forcing it to `min_page_size` on the last try. A further timeout at
    /// the minimum size is a hard failure, not retried again.
    async fn request_with_retry(&self, url: &str, params: &[(String, String)], request_type: RequestType, body: Option<&JsonValue>) -> Result<JsonValue, PaginatorError> {
        let mut attempt = 0u32;
        let mut params = params.to_vec();

        loop {
            let session_id = self.session_id.lock().await.clone();
            let mut request = match request_type {
                RequestType::Get => self.http.get(url),
                RequestType::Post => self.http.post(url),
            };
            request = request.query(&params).timeout(self.profile.request_timeout);
            if let Some(session_id) = session_id {
                request = request.header("X-Endeavour-Sessionid", session_id);
            }
            if let (RequestType::Post, Some(body)) = (request_type, body) {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.json::<JsonValue>().await.map_err(|e| PaginatorError::Transport(e.to_string()));
                }
                Ok(response) => return Err(PaginatorError::Transport(format!("status {}", response.status()))),
                Err(err) if err.is_timeout() => {
                    attempt += 1;
                    let page_size = *self.page_size.lock().await;
                    let page_start_index = params.iter().find(|(k, _)| k == "pageStartIndex").map(|(_, v)| v.clone());

                    if attempt > self.profile.max_send_retries {
                        return Err(PaginatorError::Timeout {
                            retries: attempt,
                            page_size,
                            page_start_index,
                        });
                    }
                    if page_size == self.profile.min_page_size {
                        return Err(PaginatorError::Timeout {
                            retries: attempt,
                            page_size,
                            page_start_index,
                        });
                    }

                    let new_size = if attempt == self.profile.max_send_retries {
                        self.profile.min_page_size
                    } else {
                        adjust_page_size_for_timeout(page_size, self.profile.min_page_size, self.profile.timeout_reduction)
                    };
                    warn!(attempt, new_size, "request timed out, retrying with reduced page size");
                    *self.page_size.lock().await = new_size;
                    set_param(&mut params, "pageSize", &new_size.to_string());
                }
                Err(err) => return Err(PaginatorError::Transport(err.to_string())),
            }
        }
    }
}

fn set_param(params: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(entry) = params.iter_mut().find(|(k, _)| k == key) {
        entry.1 = value.to_string();
    } else {
        params.push((key.to_string(), value.to_string()));
    }
}

fn parse_query_params(url: &str) -> Vec<(String, String)> {
    reqwest::Url::parse(url).map(|parsed| parsed.query_pairs().map(|(k, v)| (k.to_string(), v.to_string())).collect()).unwrap_or_default()
}

fn strip_query(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_grows_when_request_is_fast() {
        let new_size = adjust_page_size_for_send_time(50, 5, 30.0, 10.0, 0.10, 3.5);
        assert_eq!(new_size, 150);
    }

    #[test]
    fn page_size_shrinks_on_timeout() {
        let new_size = adjust_page_size_for_timeout(200, 5, 0.70);
        assert_eq!(new_size, 63);
    }

    #[test]
    fn page_size_unchanged_within_allowed_delta() {
        let new_size = adjust_page_size_for_send_time(50, 5, 30.0, 31.0, 0.10, 3.5);
        assert_eq!(new_size, 50);
    }

    #[test]
    fn page_size_never_below_min_plus_five() {
        let new_size = adjust_page_size_for_send_time(50, 5, 10.0, 1000.0, 0.10, 3.5);
        assert_eq!(new_size, 10);
    }

    #[test]
    fn filter_record_flattens_nested_objects_with_ignore_list() {
        let record: Map<String, JsonValue> = serde_json::from_value(serde_json::json!({
            "id": "J1",
            "properties": {"statistics": [1, 2, 3]},
            "secret": "drop me",
        }))
        .unwrap();
        let filtered = filter_record(&record, None, Some(&["secret"]));
        assert!(filtered.contains_key("id"));
        assert!(filtered.contains_key("properties.statistics"));
        assert!(!filtered.contains_key("secret"));
    }

    #[test]
    fn filter_record_allow_list_picks_only_named_keys() {
        let record: Map<String, JsonValue> = serde_json::from_value(serde_json::json!({"id": "J1", "name": "job", "extra": 1})).unwrap();
        let filtered = filter_record(&record, Some(&["id", "name"]), None);
        assert_eq!(filtered.len(), 2);
        assert!(!filtered.contains_key("extra"));
    }

    #[test]
    fn normal_and_loaded_profiles_match_spec_table() {
        let normal = PaginatorProfile::normal();
        let loaded = PaginatorProfile::loaded();
        assert_eq!(normal.starting_page_size, 50);
        assert_eq!(loaded.starting_page_size, 10);
        assert_eq!(normal.max_send_retries, 3);
        assert_eq!(loaded.max_send_retries, 1);
    }
}
