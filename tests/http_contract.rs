//! HTTP contract tests.
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot` over
//! the in-memory store, checking status codes and JSON envelopes.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use bookshelf::http::router;
use bookshelf::observability::REQUEST_ID_HEADER;
use bookshelf::storage::MemoryStore;
use bookshelf::{BookStore, ConnectionManager, ReconnectPolicy};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

const BODY_LIMIT: usize = 16 * 1024;

struct Harness {
    books: Arc<BookStore<MemoryStore>>,
    app: Router,
}

fn harness() -> Harness {
    let manager = Arc::new(ConnectionManager::new(
        MemoryStore::new(),
        ReconnectPolicy::default(),
    ));
    let books = Arc::new(BookStore::new(manager));
    let app = router(Arc::clone(&books), BODY_LIMIT);
    Harness { books, app }
}

impl Harness {
    fn store(&self) -> &MemoryStore {
        self.books.manager().store()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn post_json(&self, body: &Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/records")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }
}

fn dune() -> Value {
    json!({
        "title": "Dune",
        "rating": "5",
        "author": "Herbert",
        "blurb": "Desert planet."
    })
}

#[tokio::test]
async fn test_create_then_list_round_trip() {
    let h = harness();

    let (status, body) = h.post_json(&dune()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    let id = body["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    let (status, body) = h.get("/records").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0],
        json!({
            "id": id,
            "title": "Dune",
            "rating": "5",
            "author": "Herbert",
            "blurb": "Desert planet."
        })
    );
}

#[tokio::test]
async fn test_empty_title_is_rejected_without_write() {
    let h = harness();
    let mut body = dune();
    body["title"] = json!("");

    let (status, body) = h.post_json(&body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("title"));

    // Nothing was persisted and the store was never touched.
    assert_eq!(h.store().connect_count(), 0);
    let (_, body) = h.get("/records").await;
    assert_eq!(body["records"], json!([]));
}

#[tokio::test]
async fn test_missing_fields_are_listed_in_order() {
    let h = harness();
    let (status, body) = h.post_json(&json!({ "title": "Emma" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["message"],
        "missing required fields: rating, author, blurb"
    );
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let h = harness();
    let (status, body) = h
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/records")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let h = harness();
    let mut body = dune();
    body["blurb"] = json!("x".repeat(BODY_LIMIT * 2));
    let (status, body) = h.post_json(&body).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_empty_store_lists_nothing() {
    let h = harness();
    let (status, body) = h.get("/records").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "records": [] }));
}

#[tokio::test]
async fn test_concurrent_creates_both_listed_in_order() {
    let h = harness();
    let mut emma = dune();
    emma["title"] = json!("Emma");

    let first = dune();
    let ((s1, b1), (s2, b2)) = tokio::join!(h.post_json(&first), h.post_json(&emma));
    assert_eq!(s1, StatusCode::CREATED);
    assert_eq!(s2, StatusCode::CREATED);
    let id1: u64 = b1["id"].as_str().unwrap().parse().unwrap();
    let id2: u64 = b2["id"].as_str().unwrap().parse().unwrap();
    assert_ne!(id1, id2);

    let (_, body) = h.get("/records").await;
    let listed: Vec<u64> = body["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap().parse().unwrap())
        .collect();
    assert_eq!(listed, vec![id1.min(id2), id1.max(id2)]);
}

#[tokio::test]
async fn test_unsupported_methods_are_405() {
    let h = harness();
    for (method, uri) in [
        (Method::PUT, "/records"),
        (Method::DELETE, "/records"),
        (Method::PATCH, "/records/1"),
    ] {
        let (status, body) = h
            .send(
                Request::builder()
                    .method(method.clone())
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{method} {uri}");
        assert_eq!(
            body,
            json!({ "success": false, "message": "Method not allowed" })
        );
    }
}

#[tokio::test]
async fn test_get_single_record_and_not_found() {
    let h = harness();
    let (_, created) = h.post_json(&dune()).await;
    let id = created["id"].as_str().unwrap();

    let (status, body) = h.get(&format!("/records/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["record"]["title"], "Dune");

    let (status, body) = h.get("/records/1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_orphaned_entry_is_listed_as_degraded() {
    let h = harness();
    let (_, first) = h.post_json(&dune()).await;
    let (_, second) = h.post_json(&dune()).await;
    let orphan = second["id"].as_str().unwrap();
    assert!(h.store().delete_key(&format!("Book:{orphan}")));

    let (status, body) = h.get("/records").await;
    assert_eq!(status, StatusCode::OK);
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], first["id"]);
    assert!(records[0].get("degraded").is_none());
    assert_eq!(records[1]["id"], orphan);
    assert_eq!(records[1]["degraded"], true);
    assert_eq!(records[1]["title"], "");
}

#[tokio::test]
async fn test_unreachable_store_is_500_with_envelope() {
    let h = harness();
    h.store().set_available(false);

    let (status, body) = h.post_json(&dune()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("unavailable"));

    let (status, body) = h.get("/records").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);

    // The failed attempt left no half-open state behind.
    h.store().set_available(true);
    let (status, _) = h.post_json(&dune()).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_reports_store_state() {
    let h = harness();
    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backend"], "memory");

    // The cached flag hides the outage until a command fails.
    h.store().set_available(false);
    let (status, _) = h.get("/records").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_response_headers() {
    let h = harness();
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/records")
                .header(REQUEST_ID_HEADER, "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(headers[REQUEST_ID_HEADER], "req-123");
    assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");

    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
}

#[tokio::test]
async fn test_unknown_route_is_404_envelope() {
    let h = harness();
    let (status, body) = h.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}
