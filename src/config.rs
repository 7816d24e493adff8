//! JSON configuration loader (component I).
//!
//! The config file has two required top-level sections, `influxDB` and
//! `sppServer`, plus one optional detail flag. Missing keys are reported
//! individually via [`ConfigError::MissingKey`] rather than surfacing
//! `serde_json`'s own positional errors, so a misconfigured deployment gets
//! a message naming the exact field to fix.

use crate::error::ConfigError;
use crate::time_literal::TimeLiteral;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::path::Path;

/// TSDB connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub verify_ssl: bool,
    pub srv_port: u16,
    pub srv_address: String,
    #[serde(rename = "dbName")]
    pub db_name: String,
}

impl InfluxConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.srv_address, self.srv_port)
    }
}

/// REST API connection settings, including the job-log retention window.
#[derive(Debug, Clone, Deserialize)]
pub struct SppServerConfig {
    pub username: String,
    pub password: String,
    pub srv_address: String,
    pub srv_port: u16,
    #[serde(rename = "jobLog_retention", deserialize_with = "deserialize_time_literal", default = "default_job_log_retention")]
    pub job_log_retention: TimeLiteral,
}

impl SppServerConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.srv_address, self.srv_port)
    }
}

fn default_job_log_retention() -> TimeLiteral {
    TimeLiteral::parse("60d").expect("60d is a valid time literal")
}

fn deserialize_time_literal<'de, D>(deserializer: D) -> Result<TimeLiteral, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    TimeLiteral::parse(&raw).map_err(serde::de::Error::custom)
}

/// Root configuration object loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "influxDB")]
    pub influx_db: InfluxConfig,
    #[serde(rename = "sppServer")]
    pub spp_server: SppServerConfig,
}

impl Config {
    /// Reads and validates a config file at `path`. Every required key is
    /// checked explicitly before deserialization so a missing key is
    /// reported by name instead of `serde_json`'s generic "missing field".
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: JsonValue = serde_json::from_str(&contents)?;

        require_section(&raw, "influxDB")?;
        require_section(&raw, "sppServer")?;
        for key in ["username", "password", "ssl", "verify_ssl", "srv_port", "srv_address", "dbName"] {
            require_key(&raw, "influxDB", key)?;
        }
        for key in ["username", "password", "srv_address", "srv_port"] {
            require_key(&raw, "sppServer", key)?;
        }

        let config: Config = serde_json::from_value(raw)?;
        Ok(config)
    }
}

fn require_section<'a>(raw: &'a JsonValue, section: &str) -> Result<&'a JsonValue, ConfigError> {
    raw.get(section).ok_or_else(|| ConfigError::MissingKey(section.to_string()))
}

fn require_key(raw: &JsonValue, section: &str, key: &str) -> Result<(), ConfigError> {
    let value = require_section(raw, section)?;
    if value.get(key).is_none() {
        return Err(ConfigError::MissingKey(format!("{section}.{key}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_parses_both_sections() {
        let file = write_temp(
            r#"{
                "influxDB": {"username": "u", "password": "p", "ssl": true, "verify_ssl": false, "srv_port": 8086, "srv_address": "tsdb.local", "dbName": "sppmon"},
                "sppServer": {"username": "admin", "password": "secret", "srv_address": "spp.local", "srv_port": 443}
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.influx_db.db_name, "sppmon");
        assert_eq!(config.spp_server.job_log_retention.to_string(), "60d");
    }

    #[test]
    fn load_honors_explicit_job_log_retention() {
        let file = write_temp(
            r#"{
                "influxDB": {"username": "u", "password": "p", "ssl": false, "verify_ssl": false, "srv_port": 8086, "srv_address": "tsdb.local", "dbName": "sppmon"},
                "sppServer": {"username": "admin", "password": "secret", "srv_address": "spp.local", "srv_port": 443, "jobLog_retention": "30d"}
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.spp_server.job_log_retention.to_string(), "30d");
    }

    #[test]
    fn load_reports_missing_key_by_name() {
        let file = write_temp(
            r#"{
                "influxDB": {"username": "u", "ssl": true, "verify_ssl": false, "srv_port": 8086, "srv_address": "tsdb.local", "dbName": "sppmon"},
                "sppServer": {"username": "admin", "password": "secret", "srv_address": "spp.local", "srv_port": 443}
            }"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref key) if key == "influxDB.password"));
    }

    #[test]
    fn load_reports_missing_section() {
        let file = write_temp(r#"{"sppServer": {"username": "admin", "password": "secret", "srv_address": "spp.local", "srv_port": 443}}"#);
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref key) if key == "influxDB"));
    }
}
