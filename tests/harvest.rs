//! Integration tests for the job-log harvester (component G) against mock
//! REST and TSDB servers: exercises the unharvested-session discovery query,
//! recognized/unrecognized log splitting, and the atomic delete/re-insert
//! swap, including a session whose log fetch fails.

#[cfg(test)]
mod tests {
    use sppmon::buffer::WriteBuffer;
    use sppmon::harvest::JobHarvester;
    use sppmon::rest::{PaginatorProfile, RestClient};
    use sppmon::schema::definitions::declare_all;
    use sppmon::schema::Catalog;
    use sppmon::storage::StorageClient;
    use sppmon::time_literal::TimeLiteral;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request};

    struct QueryContains(&'static str);

    impl wiremock::Match for QueryContains {
        fn matches(&self, request: &Request) -> bool {
            request.url.query().map(|q| q.contains(self.0)).unwrap_or(false)
        }
    }

    fn catalog() -> Arc<Catalog> {
        let mut catalog = Catalog::new("sppmon");
        declare_all(&mut catalog).unwrap();
        Arc::new(catalog)
    }

    async fn harness() -> (MockServer, MockServer, JobHarvester, Arc<WriteBuffer>) {
        let rest_server = MockServer::start().await;
        let storage_server = MockServer::start().await;

        let http = reqwest::Client::new();
        let storage = Arc::new(StorageClient::new(http.clone(), storage_server.uri(), "sppmon"));
        let rest = Arc::new(RestClient::new(http, rest_server.uri(), "admin", "secret", PaginatorProfile::normal()));
        let buffer = Arc::new(WriteBuffer::new(storage.clone()));
        let catalog = catalog();

        let harvester = JobHarvester::new(storage, rest, buffer.clone(), catalog, TimeLiteral::parse("60d").unwrap(), vec!["SUMMARY".to_string()]);
        (rest_server, storage_server, harvester, buffer)
    }

    #[tokio::test]
    async fn harvest_job_logs_parses_recognized_log_and_swaps_session_atomically() {
        let (rest_server, storage_server, harvester, buffer) = harness().await;

        let select_response = serde_json::json!({
            "results": [{
                "series": [{
                    "columns": ["id", "jobId", "jobName", "start"],
                    "values": [[101, "job-A", "nightly", 1_700_000_000]],
                }],
            }],
        });
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(QueryContains("SELECT"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(select_response))
            .mount(&storage_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/query"))
            .and(QueryContains("DELETE"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": [{}]})))
            .mount(&storage_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/write"))
            .respond_with(wiremock::ResponseTemplate::new(204))
            .mount(&storage_server)
            .await;

        let logs_response = serde_json::json!({
            "logs": [
                {
                    "jobsessionId": 101, "logTime": 1_700_000_100_000i64, "id": 1,
                    "messageId": "CTGGA0072", "message": "replicate summary",
                    "messageParams": ["10", "1", "5s"], "type": "SUMMARY",
                },
                {
                    "jobsessionId": 101, "logTime": 1_700_000_200_000i64, "id": 2,
                    "messageId": "CTGGX0000", "message": "unrecognized",
                    "messageParams": [], "type": "SUMMARY",
                },
            ],
        });
        Mock::given(method("GET"))
            .and(path("/api/endeavour/log/job"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(logs_response))
            .mount(&rest_server)
            .await;

        harvester.harvest_job_logs().await.unwrap();

        let metrics = buffer.flush(false).await;
        let total_items: usize = metrics.iter().map(|m| m.item_count).sum();
        // one jobs row (the re-inserted session), two jobLogs rows, one vmReplicateSummary row
        assert_eq!(total_items, 4);
        assert!(metrics.iter().all(|m| m.error.is_none()));
    }

    #[tokio::test]
    async fn harvest_job_logs_retains_session_on_fetch_failure_instead_of_dropping_it() {
        let (rest_server, storage_server, harvester, buffer) = harness().await;

        let select_response = serde_json::json!({
            "results": [{
                "series": [{
                    "columns": ["id", "jobId", "jobName", "start"],
                    "values": [[202, "job-B", "weekly", 1_700_000_000]],
                }],
            }],
        });
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(QueryContains("SELECT"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(select_response))
            .mount(&storage_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/query"))
            .and(QueryContains("DELETE"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": [{}]})))
            .mount(&storage_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/write"))
            .respond_with(wiremock::ResponseTemplate::new(204))
            .mount(&storage_server)
            .await;

        // REST log fetch fails outright; the session must still be re-inserted
        // unchanged by the atomic swap, not silently dropped.
        Mock::given(method("GET"))
            .and(path("/api/endeavour/log/job"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&rest_server)
            .await;

        harvester.harvest_job_logs().await.unwrap();

        let metrics = buffer.flush(false).await;
        let jobs_metric = metrics.iter().find(|m| m.table_name == "jobs").expect("jobs row should have been re-inserted after the failed session");
        assert_eq!(jobs_metric.item_count, 1);
    }
}
