//! Integration tests for the REST paginator (component F) against a mock
//! HTTP server, covering multi-page following and the allow-list array
//! error path without touching a live API.

#[cfg(test)]
mod tests {
    use sppmon::rest::{PaginatorProfile, RestClient};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile() -> PaginatorProfile {
        let mut profile = PaginatorProfile::normal();
        profile.starting_page_size = 2;
        profile
    }

    #[tokio::test]
    async fn get_objects_follows_next_page_link_across_two_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/endeavour/job"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobs": [{"id": "1", "name": "nightly"}],
                "links": {"nextPage": {"href": format!("{}/api/endeavour/job?pageStartIndex=1", server.uri())}},
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/endeavour/job"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobs": [{"id": "2", "name": "weekly"}],
                "links": {},
            })))
            .mount(&server)
            .await;

        let client = RestClient::new(reqwest::Client::new(), server.uri(), "admin", "secret", profile());
        let rows = client.get_objects("/api/endeavour/job", Some("jobs"), Some(&["id", "name"]), None, false, &[]).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id").unwrap(), "1");
        assert_eq!(rows[1].get("id").unwrap(), "2");
    }

    #[tokio::test]
    async fn get_objects_errors_when_array_name_is_missing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/endeavour/job"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"unexpected": []})))
            .mount(&server)
            .await;

        let client = RestClient::new(reqwest::Client::new(), server.uri(), "admin", "secret", profile());
        let err = client.get_objects("/api/endeavour/job", Some("jobs"), None, None, false, &[]).await.unwrap_err();
        assert!(matches!(err, sppmon::error::PaginatorError::ExpectedArray(ref key) if key == "jobs"));
    }

    #[tokio::test]
    async fn login_failure_surfaces_as_login_failed_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/endeavour/session"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = RestClient::new(reqwest::Client::new(), server.uri(), "admin", "wrong", profile());
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, sppmon::error::PaginatorError::LoginFailed(_)));
    }

    #[tokio::test]
    async fn login_stores_session_id_used_on_later_requests() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/endeavour/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sessionid": "abc123"})))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/endeavour/job"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"jobs": [], "links": {}})))
            .mount(&server)
            .await;

        let client = RestClient::new(reqwest::Client::new(), server.uri(), "admin", "secret", profile());
        client.login().await.unwrap();
        let rows = client.get_objects("/api/endeavour/job", Some("jobs"), None, None, false, &[]).await.unwrap();
        assert!(rows.is_empty());
    }
}
