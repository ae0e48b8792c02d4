use axum::extract::State;
use axum::http::StatusCode;
use roster_service::metric;
use tokio_util::sync::CancellationToken;

use crate::endpoints::ResponseError;
use crate::service::RequestService;

/// Reports whether the store can serve requests.
pub async fn healthcheck(
    State(service): State<RequestService>,
) -> Result<&'static str, ResponseError> {
    metric!(counter("healthcheck") += 1);

    let request = CancellationToken::new();
    let _guard = request.clone().drop_guard();
    let deadline = service.writer().deadline(&request);

    match service.writer().ping(&deadline).await {
        Ok(()) => Ok("ok"),
        Err(error) => {
            tracing::warn!(error = &error as &dyn std::error::Error, "health check failed");
            Err((StatusCode::SERVICE_UNAVAILABLE, "db not reachable").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::{Client, StatusCode};

    use crate::test;

    #[tokio::test]
    async fn test_healthcheck() {
        test::setup();
        let (server, store) = test::server_with_default_service();

        let response = Client::new()
            .get(server.url("/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");

        store.set_failure(Some("connection refused"));
        let response = Client::new()
            .get(server.url("/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "db not reachable");
    }
}
