//! Integration tests for the config loader (component I) covering the
//! filesystem- and JSON-syntax-level failure paths that the inline unit
//! tests (which only exercise the key-presence checks) don't reach.

#[cfg(test)]
mod tests {
    use sppmon::config::Config;
    use sppmon::error::ConfigError;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_reports_io_error_for_missing_file() {
        let err = Config::load("/nonexistent/path/to/sppmon.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reports_json_error_for_malformed_syntax() {
        let file = write_temp("{ not valid json");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn influx_base_url_respects_ssl_flag() {
        let file = write_temp(
            r#"{
                "influxDB": {"username": "u", "password": "p", "ssl": true, "verify_ssl": true, "srv_port": 8086, "srv_address": "tsdb.local", "dbName": "sppmon"},
                "sppServer": {"username": "admin", "password": "secret", "srv_address": "spp.local", "srv_port": 443}
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.influx_db.base_url(), "https://tsdb.local:8086");
        assert_eq!(config.spp_server.base_url(), "https://spp.local:443");
    }

    #[test]
    fn influx_base_url_falls_back_to_http_without_ssl() {
        let file = write_temp(
            r#"{
                "influxDB": {"username": "u", "password": "p", "ssl": false, "verify_ssl": false, "srv_port": 8086, "srv_address": "tsdb.local", "dbName": "sppmon"},
                "sppServer": {"username": "admin", "password": "secret", "srv_address": "spp.local", "srv_port": 443}
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.influx_db.base_url(), "http://tsdb.local:8086");
    }
}
