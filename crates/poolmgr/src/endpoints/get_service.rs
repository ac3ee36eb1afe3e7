use axum::body::Bytes;
use axum::extract;
use poolmgr_service::types::Identity;

use crate::service::RequestService;

use super::ResponseError;

/// Resolves the function identified by the JSON body to the address of a running instance.
///
/// The response body is the bare address, without scheme.
pub async fn get_service_for_function(
    extract::State(service): extract::State<RequestService>,
    body: Bytes,
) -> Result<String, ResponseError> {
    let function: Identity = serde_json::from_slice(&body)?;

    sentry::configure_scope(|scope| {
        scope.set_tag("function.name", &function.name);
        scope.set_tag("function.uid", &function.uid);
    });

    let _guard = service.admit()?;
    let address = service.resolver().resolve(&function).await?;

    Ok(address)
}

#[cfg(test)]
mod tests {
    use reqwest::{Client, StatusCode};
    use serde_json::json;

    use crate::test;

    #[tokio::test]
    async fn test_resolves_function() {
        let server = test::server_with_default_service();
        let client = Client::new();

        let request = || {
            client
                .post(server.url("/v1/getServiceForFunction"))
                .json(&json!({"name": "hello", "uid": "v1"}))
                .send()
        };

        let response = request().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let address = response.text().await.unwrap();
        assert_eq!(address, "10.0.0.5:8888");

        // the second request hits the cache
        let response = request().await.unwrap();
        assert_eq!(response.text().await.unwrap(), address);
        assert_eq!(server.orchestrator.injections(), 1);
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let server = test::server_with_default_service();

        let response = Client::new()
            .post(server.url("/v1/getServiceForFunction"))
            .json(&json!({"name": "goodbye", "uid": "v1"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.unwrap();
        insta::assert_yaml_snapshot!(body, @r###"
        detail: "not found: function goodbye@v1"
        "###);
    }

    #[tokio::test]
    async fn test_missing_uid() {
        let server = test::server_with_default_service();

        let response = Client::new()
            .post(server.url("/v1/getServiceForFunction"))
            .json(&json!({"name": "hello"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(server.orchestrator.created(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = test::server_with_default_service();

        let response = Client::new()
            .post(server.url("/v1/getServiceForFunction"))
            .body("hello@v1")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "malformed function identity");
        assert!(body["causes"].is_array());
    }

    #[tokio::test]
    async fn test_metadata_outage() {
        let server = test::server_with_default_service();
        server.store.set_offline(true);

        let response = Client::new()
            .post(server.url("/v1/getServiceForFunction"))
            .json(&json!({"name": "hello", "uid": "v1"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = response.json().await.unwrap();
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("upstream unavailable"), "{detail}");
    }

    #[tokio::test]
    async fn test_too_many_requests() {
        let mut config = test::config();
        config.max_concurrent_requests = Some(0);
        let server = test::server_with_config(&config);

        let response = Client::new()
            .post(server.url("/v1/getServiceForFunction"))
            .json(&json!({"name": "hello", "uid": "v1"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "maximum number of concurrent requests reached");
        assert_eq!(server.orchestrator.created(), 0);
    }
}
