//! The `/users` resource.
//!
//! Every handler runs under a [`Deadline`](roster_service::deadline::Deadline) derived from a
//! request-scoped cancellation token. The token is cancelled when axum drops the handler, which
//! happens when the client disconnects.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use roster_service::store::parse_id;
use roster_service::types::{NewUser, User, UserPatch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::endpoints::{ResponseError, X_SOURCE};
use crate::service::RequestService;

/// Creates the cancellation token of a request, cancelled once the returned guard is dropped.
fn request_scope() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

fn validate_id(id: &str) -> Result<(), ResponseError> {
    match parse_id(id) {
        Some(_) => Ok(()),
        None => Err((StatusCode::BAD_REQUEST, "invalid id").into()),
    }
}

pub async fn list_users(
    State(service): State<RequestService>,
) -> Result<Json<Vec<User>>, ResponseError> {
    let (request, _guard) = request_scope();
    let deadline = service.writer().deadline(&request);

    let users = service.writer().list(&deadline).await?;
    Ok(Json(users))
}

#[tracing::instrument(skip_all, fields(user_id = %id))]
pub async fn get_user(
    State(service): State<RequestService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ResponseError> {
    let (request, _guard) = request_scope();
    let deadline = service.reader().deadline(&request);

    let fetched = service.reader().get(&id, &deadline).await?;
    Ok(([(X_SOURCE, fetched.source.as_str())], Json(fetched.user)))
}

pub async fn create_user(
    State(service): State<RequestService>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Result<impl IntoResponse, ResponseError> {
    let Json(new_user) = body?;
    new_user.validate()?;

    let (request, _guard) = request_scope();
    let deadline = service.writer().deadline(&request);

    let user = service.writer().create(&new_user, &deadline).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[tracing::instrument(skip_all, fields(user_id = %id))]
pub async fn update_user(
    State(service): State<RequestService>,
    Path(id): Path<String>,
    body: Result<Json<UserPatch>, JsonRejection>,
) -> Result<Json<User>, ResponseError> {
    validate_id(&id)?;
    let Json(patch) = body?;
    patch.validate()?;

    let (request, _guard) = request_scope();
    let deadline = service.writer().deadline(&request);

    let user = service.writer().update(&id, &patch, &deadline).await?;
    Ok(Json(user))
}

#[tracing::instrument(skip_all, fields(user_id = %id))]
pub async fn delete_user(
    State(service): State<RequestService>,
    Path(id): Path<String>,
) -> Result<StatusCode, ResponseError> {
    validate_id(&id)?;

    let (request, _guard) = request_scope();
    let deadline = service.writer().deadline(&request);

    service.writer().delete(&id, &deadline).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::{Client, Response, StatusCode};
    use roster_service::config::{Config, ReadPolicy};
    use roster_service::store::MemoryStore;
    use serde_json::{Value, json};

    use crate::test;

    fn source_of(response: &Response) -> &str {
        response.headers()[super::X_SOURCE].to_str().unwrap()
    }

    #[tokio::test]
    async fn test_get_db_then_cache() {
        test::setup();
        let (server, store) = test::server_with_default_service();
        let ada = store.insert("Ada", "Lovelace");
        let client = Client::new();

        let response = client
            .get(server.url(&format!("/users/{}", ada.id)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(source_of(&response), "db");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["firstName"], "Ada");
        assert_eq!(body["lastName"], "Lovelace");

        let response = client
            .get(server.url(&format!("/users/{}", ada.id)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(source_of(&response), "cache");
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_user() {
        test::setup();
        let (server, _store) = test::server_with_default_service();

        let response = Client::new()
            .get(server.url("/users/999"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "detail": "user not found"
        }
        "###);
    }

    #[tokio::test]
    async fn test_get_timeout() {
        test::setup();
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(300)));
        let ada = store.insert("Ada", "Lovelace");

        let mut config = Config::default();
        config.reads.timeout = Duration::from_millis(50);
        let server = test::server_with_store(config, store);

        let response = Client::new()
            .get(server.url(&format!("/users/{}", ada.id)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_get_store_failure_is_not_leaked() {
        test::setup();
        let (server, store) = test::server_with_default_service();
        store.set_failure(Some("password authentication failed for user roster"));

        let response = Client::new()
            .get(server.url("/users/1"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "detail": "internal server error"
        }
        "###);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_read() {
        test::setup();
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(100)));
        let ada = store.insert("Ada", "Lovelace");
        let server = test::server_with_store(Config::default(), Arc::clone(&store));
        let client = Client::new();
        let url = server.url(&format!("/users/{}", ada.id));

        let responses = futures::future::join_all((0..50).map(|_| client.get(url.clone()).send())).await;

        let mut sources = Vec::new();
        for response in responses {
            let response = response.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            sources.push(source_of(&response).to_owned());
        }
        assert_eq!(store.reads(), 1);
        assert_eq!(sources.iter().filter(|s| *s == "db").count(), 1);
        assert!(sources.iter().all(|s| s == "db" || s == "shared" || s == "cache"));
    }

    #[tokio::test]
    async fn test_race_policy() {
        test::setup();
        let store = Arc::new(MemoryStore::new());
        let ada = store.insert("Ada", "Lovelace");

        let mut config = Config::default();
        config.reads.policy = ReadPolicy::Race;
        let server = test::server_with_store(config, Arc::clone(&store));
        let client = Client::new();
        let url = server.url(&format!("/users/{}", ada.id));

        let response = client.get(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(source_of(&response), "db");

        // The store result was written through, so the cache attempt can win now.
        let response = client.get(url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(matches!(source_of(&response), "cache" | "db"));

        let response = client
            .get(server.url("/users/999"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_user() {
        test::setup();
        let (server, _store) = test::server_with_default_service();
        let client = Client::new();

        let response = client
            .post(server.url("/users"))
            .json(&json!({"firstName": "Grace", "lastName": "Hopper"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Value = response.json().await.unwrap();
        assert_eq!(created["firstName"], "Grace");
        assert!(created["id"].is_string());
        assert!(created["createdAt"].is_string());

        let response = client
            .post(server.url("/users"))
            .json(&json!({"firstName": "Grace", "lastName": "Hopper"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = client
            .get(server.url("/users"))
            .send()
            .await
            .unwrap();
        let users: Value = response.json().await.unwrap();
        assert_eq!(users, json!([created]));
    }

    #[tokio::test]
    async fn test_create_invalid_user() {
        test::setup();
        let (server, _store) = test::server_with_default_service();
        let client = Client::new();

        let response = client
            .post(server.url("/users"))
            .json(&json!({"firstName": "Grace"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "firstName and lastName are required");

        let response = client
            .post(server.url("/users"))
            .json(&json!({"firstName": "Grace", "lastName": "Hopper", "admin": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = client
            .post(server.url("/users"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_then_get() {
        test::setup();
        let (server, store) = test::server_with_default_service();
        let ada = store.insert("Ada", "Lovelace");
        let client = Client::new();
        let url = server.url(&format!("/users/{}", ada.id));

        // Warm up the cache.
        client.get(url.clone()).send().await.unwrap();
        let response = client.get(url.clone()).send().await.unwrap();
        assert_eq!(source_of(&response), "cache");

        let response = client
            .patch(url.clone())
            .json(&json!({"firstName": "Augusta"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Value = response.json().await.unwrap();
        assert_eq!(updated["firstName"], "Augusta");
        assert_eq!(updated["lastName"], "Lovelace");

        let response = client.get(url).send().await.unwrap();
        assert_eq!(source_of(&response), "db");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["firstName"], "Augusta");
    }

    #[tokio::test]
    async fn test_invalid_update() {
        test::setup();
        let (server, store) = test::server_with_default_service();
        let ada = store.insert("Ada", "Lovelace");
        let client = Client::new();

        let response = client
            .patch(server.url("/users/abc"))
            .json(&json!({"firstName": "Augusta"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "invalid id");

        let response = client
            .patch(server.url(&format!("/users/{}", ada.id)))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "no fields to update");

        let response = client
            .patch(server.url(&format!("/users/{}", ada.id)))
            .json(&json!({"lastName": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["detail"], "lastName cannot be empty");

        let response = client
            .patch(server.url("/users/999"))
            .json(&json!({"firstName": "Nobody"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_user() {
        test::setup();
        let (server, store) = test::server_with_default_service();
        let ada = store.insert("Ada", "Lovelace");
        let client = Client::new();
        let url = server.url(&format!("/users/{}", ada.id));

        client.get(url.clone()).send().await.unwrap();

        let response = client.delete(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = client.get(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client.delete(url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client.delete(server.url("/users/0")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
