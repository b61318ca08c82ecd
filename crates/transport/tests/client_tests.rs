use conductor_core::CancelToken;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use transport::{
    CacheMode, CallOptions, ClientConfig, ClientError, RetryPolicy, TransportClient,
    TransportError,
};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_backoff_factor(Duration::from_millis(10))
}

fn client_for(server: &MockServer, retry: RetryPolicy) -> TransportClient {
    TransportClient::new(ClientConfig::new(server.uri()).with_retry(retry)).unwrap()
}

mod decoding {
    use super::*;

    #[tokio::test]
    async fn test_get_returns_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entities": []})))
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let body = client.get("/api/clusters").await.unwrap();
        assert_eq!(body, json!({"entities": []}));
    }

    #[tokio::test]
    async fn test_plain_text_is_returned_raw() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string("6.5.2"))
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        assert_eq!(client.get("/version").await.unwrap(), json!("6.5.2"));
    }

    #[tokio::test]
    async fn test_claimed_json_that_fails_to_parse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{not json", "application/json"))
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let err = client.get("/broken").await.unwrap_err();
        match err {
            ClientError::Transport(e @ TransportError::Decode { .. }) => {
                assert_eq!(e.kind(), "HTTPError");
                assert_eq!(e.status(), Some(200));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inband_login_marker_is_promoted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<Response [401]>"))
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let err = client.get("/users/me").await.unwrap_err();
        assert!(matches!(err, ClientError::Response(_)));
        assert_eq!(err.kind(), "LoginFailed");
    }

    #[tokio::test]
    async fn test_inband_markers_can_be_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<Response [502]>"))
            .mount(&server)
            .await;

        let client = TransportClient::new(
            ClientConfig::new(server.uri())
                .with_retry(RetryPolicy::none())
                .with_inband_error_markers(false),
        )
        .unwrap();
        assert_eq!(client.get("/x").await.unwrap(), json!("<Response [502]>"));
    }

    #[tokio::test]
    async fn test_error_status_carries_decoded_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/subnets"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"message": "already exists"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_retry(4));
        let err = client.post("/subnets", &json!({"name": "vlan10"})).await.unwrap_err();
        assert_eq!(err.kind(), "HTTPError");
        assert_eq!(err.status(), Some(409));
        match err {
            ClientError::Transport(e) => {
                assert_eq!(e.body(), Some(json!({"message": "already exists"})));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

mod retries {
    use super::*;

    #[tokio::test]
    async fn test_retry_ceiling_is_exact() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_retry(3));
        let err = client.get("/flaky").await.unwrap_err();
        assert_eq!(err.status(), Some(503));

        server.verify().await;
    }

    #[tokio::test]
    async fn test_recovers_after_two_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/value"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/value"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(
            &server,
            RetryPolicy::default()
                .with_max_attempts(4)
                .with_backoff_factor(Duration::from_millis(1500)),
        );

        let started = Instant::now();
        let body = client.get("/value").await.unwrap();
        assert_eq!(body, json!({"value": true}));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_patch_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, fast_retry(4));
        let err = client.patch("/vm/1", &json!({"name": "x"})).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_retry_after_header_is_honoured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1})))
            .mount(&server)
            .await;

        // A huge backoff factor proves the header value (0s) was used instead.
        let client = client_for(
            &server,
            RetryPolicy::default().with_backoff_factor(Duration::from_secs(60)),
        );
        let body = tokio::time::timeout(Duration::from_secs(5), client.get("/limited"))
            .await
            .expect("Retry-After should short-circuit the backoff")
            .unwrap();
        assert_eq!(body, json!({"ok": 1}));
    }

    #[tokio::test]
    async fn test_connection_failure_is_normalized() {
        let client = TransportClient::new(
            ClientConfig::new("http://127.0.0.1:1").with_retry(fast_retry(2)),
        )
        .unwrap();

        let err = client.get("/anything").await.unwrap_err();
        assert_eq!(err.kind(), "ConnectionError");
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(
            &server,
            RetryPolicy::default().with_backoff_factor(Duration::from_secs(60)),
        );
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let options = CallOptions::new().with_cancel(token);
        let err = tokio::time::timeout(Duration::from_secs(5), client.get_with("/x", &options))
            .await
            .expect("cancel should interrupt the sleep")
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Cancelled)));
    }
}

mod request_shape {
    use super::*;

    #[tokio::test]
    async fn test_basic_auth_and_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/nutanix/v3/subnets"))
            .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
            .and(header("x-config-source", "conductor"))
            .and(header("x-request", "per-call"))
            .and(body_json(json!({"spec": {"name": "vlan10"}})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"status": {"state": "PENDING"}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = TransportClient::new(
            ClientConfig::new(server.uri())
                .with_base_path("/api/nutanix/v3")
                .with_credentials("admin", "secret")
                .with_header("x-config-source", "conductor"),
        )
        .unwrap();

        let options = CallOptions::new().with_header("x-request", "per-call");
        let body = client
            .post_with("subnets", &json!({"spec": {"name": "vlan10"}}), &options)
            .await
            .unwrap();
        assert_eq!(body["status"]["state"], "PENDING");
    }

    #[tokio::test]
    async fn test_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks"))
            .and(query_param("length", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let options = CallOptions::new().with_query("length", "50");
        assert_eq!(client.get_with("/tasks", &options).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_typed_helper() {
        #[derive(serde::Deserialize)]
        struct Cluster {
            name: String,
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "c1"})))
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let cluster: Cluster = client.get_json("/cluster").await.unwrap();
        assert_eq!(cluster.name, "c1");

        let err = client.get_json::<Vec<Value>>("/cluster").await.unwrap_err();
        assert!(matches!(err, ClientError::Deserialize(_)));
    }

    #[tokio::test]
    async fn test_typed_post_helper() {
        #[derive(serde::Deserialize)]
        struct Created {
            uuid: String,
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vms"))
            .and(body_json(json!({"name": "vm-1"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"uuid": "u-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, RetryPolicy::none());
        let created: Created = client.post_json("/vms", &json!({"name": "vm-1"})).await.unwrap();
        assert_eq!(created.uuid, "u-1");
    }
}

mod caching {
    use super::*;

    #[tokio::test]
    async fn test_get_is_cached_and_writes_invalidate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["c1"])))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = TransportClient::new(
            ClientConfig::new(server.uri())
                .with_retry(RetryPolicy::none())
                .with_cache(CacheMode::Memory {
                    ttl: Duration::from_secs(300),
                }),
        )
        .unwrap();

        client.get("/clusters").await.unwrap();
        client.get("/clusters").await.unwrap();
        assert_eq!(client.delete("/clusters/c2").await.unwrap(), Value::Null);
        client.get("/clusters").await.unwrap();

        server.verify().await;
    }
}
