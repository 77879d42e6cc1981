//! Router-level tests: real HTTP requests through the axum app, backed by
//! in-memory storage.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use bytes::Bytes;
use tower::ServiceExt;

use resumable_upload::config::Config;
use resumable_upload::engine::UploadEngine;
use resumable_upload::metadata::memory::MemoryIdempotencyIndex;
use resumable_upload::protocol::{
    IDEMPOTENCY_KEY, INTEROP_VERSION, UPLOAD_COMPLETE, UPLOAD_INCOMPLETE, UPLOAD_OFFSET,
};
use resumable_upload::server::app;
use resumable_upload::storage::memory::MemoryBackend;
use resumable_upload::AppState;

const PUBLIC_URL: &str = "http://localhost:8080";

fn test_app_with(config: Config) -> (Router, Arc<UploadEngine>) {
    let engine = Arc::new(UploadEngine::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryIdempotencyIndex::new()),
        PUBLIC_URL,
    ));
    let state = Arc::new(AppState {
        config,
        engine: engine.clone(),
    });
    (app(state), engine)
}

fn test_app() -> (Router, Arc<UploadEngine>) {
    test_app_with(Config::default())
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn header_str<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Path part of an absolute upload location.
fn path_of(location: &str) -> String {
    location.strip_prefix(PUBLIC_URL).unwrap().to_string()
}

fn id_of(location: &str) -> String {
    location.rsplit('/').next().unwrap().to_string()
}

#[tokio::test]
async fn test_create_append_query_draft3() {
    let (app, engine) = test_app();

    let resp = send(
        &app,
        Request::post("/")
            .header(INTEROP_VERSION, "3")
            .header(UPLOAD_INCOMPLETE, "?1")
            .body(Body::from("Hello, "))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("7"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?1"));
    assert_eq!(header_str(&resp, INTEROP_VERSION), Some("3"));
    let location = header_str(&resp, "location").unwrap().to_string();
    assert!(location.starts_with("http://localhost:8080/uploads/"));

    let resp = send(
        &app,
        Request::patch(path_of(&location))
            .header(INTEROP_VERSION, "3")
            .header(UPLOAD_OFFSET, "7")
            .body(Body::from("World!"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("13"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?0"));

    let resp = send(
        &app,
        Request::head(path_of(&location))
            .header(INTEROP_VERSION, "3")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("13"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?0"));
    assert_eq!(header_str(&resp, "cache-control"), Some("no-store"));

    let stored = engine.store().read(&id_of(&location)).await.unwrap();
    assert_eq!(stored, Some(Bytes::from("Hello, World!")));
}

#[tokio::test]
async fn test_draft4_uses_upload_complete() {
    let (app, _) = test_app();
    let resp = send(
        &app,
        Request::post("/")
            .header(INTEROP_VERSION, "4")
            .header(UPLOAD_COMPLETE, "?0")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(header_str(&resp, INTEROP_VERSION), Some("4"));
    assert_eq!(header_str(&resp, UPLOAD_COMPLETE), Some("?0"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), None);
    let location = header_str(&resp, "location").unwrap().to_string();

    let resp = send(
        &app,
        Request::patch(path_of(&location))
            .header(INTEROP_VERSION, "4")
            .header(UPLOAD_OFFSET, "3")
            .header(UPLOAD_COMPLETE, "?1")
            .body(Body::from("def"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("6"));
    assert_eq!(header_str(&resp, UPLOAD_COMPLETE), Some("?1"));
}

#[tokio::test]
async fn test_legacy_peer_without_headers_completes_in_one_request() {
    let (app, _) = test_app();
    let resp = send(&app, Request::post("/").body(Body::from("xyz")).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(header_str(&resp, INTEROP_VERSION), None);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("3"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?0"));
}

#[tokio::test]
async fn test_unknown_interop_version_falls_back_to_default() {
    let (app, _) = test_app();
    let resp = send(
        &app,
        Request::post("/")
            .header(INTEROP_VERSION, "99")
            .header(UPLOAD_INCOMPLETE, "?1")
            .body(Body::from("a"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(header_str(&resp, INTEROP_VERSION), Some("3"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?1"));
}

#[tokio::test]
async fn test_append_errors() {
    let (app, _) = test_app();

    let resp = send(
        &app,
        Request::patch("/uploads/does-not-exist")
            .header(UPLOAD_OFFSET, "0")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(resp).await, "upload not found\n");

    let resp = send(
        &app,
        Request::post("/")
            .header(UPLOAD_INCOMPLETE, "?1")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    let location = header_str(&resp, "location").unwrap().to_string();

    let resp = send(
        &app,
        Request::patch(path_of(&location))
            .header(UPLOAD_OFFSET, "-1")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_text(resp).await,
        "invalid or missing Upload-Offset header\n"
    );

    let resp = send(
        &app,
        Request::patch(path_of(&location))
            .header(UPLOAD_OFFSET, "1")
            .body(Body::from("x"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("3"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?1"));
    assert_eq!(body_text(resp).await, "mismatching Upload-Offset value\n");

    let resp = send(
        &app,
        Request::patch(path_of(&location))
            .header(UPLOAD_OFFSET, "3")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(
        &app,
        Request::patch(path_of(&location))
            .header(UPLOAD_OFFSET, "3")
            .body(Body::from("more"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("3"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?0"));
    assert_eq!(body_text(resp).await, "upload is already complete\n");
}

#[tokio::test]
async fn test_cancel_then_everything_is_not_found() {
    let (app, _) = test_app();
    let resp = send(
        &app,
        Request::post("/")
            .header(UPLOAD_INCOMPLETE, "?1")
            .body(Body::from("abc"))
            .unwrap(),
    )
    .await;
    let path = path_of(header_str(&resp, "location").unwrap());

    let resp = send(&app, Request::delete(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = send(&app, Request::head(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = send(
        &app,
        Request::patch(&path)
            .header(UPLOAD_OFFSET, "3")
            .body(Body::from("d"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = send(&app, Request::delete(&path).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_idempotent_create_over_http() {
    let (app, engine) = test_app();
    let resp = send(
        &app,
        Request::post("/")
            .header(IDEMPOTENCY_KEY, "retry-me")
            .header(UPLOAD_INCOMPLETE, "?1")
            .body(Body::from("Hello"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let location = header_str(&resp, "location").unwrap().to_string();

    let resp = send(
        &app,
        Request::post("/")
            .header(IDEMPOTENCY_KEY, "retry-me")
            .body(Body::from("Hello, World!"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(header_str(&resp, "location"), Some(location.as_str()));
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("13"));
    assert_eq!(header_str(&resp, UPLOAD_INCOMPLETE), Some("?0"));

    let resp = send(
        &app,
        Request::post("/")
            .header(IDEMPOTENCY_KEY, "retry-me")
            .body(Body::from("Hello, World!"))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, "location"), Some(location.as_str()));

    let stored = engine.store().read(&id_of(&location)).await.unwrap();
    assert_eq!(stored, Some(Bytes::from("Hello, World!")));
}

#[tokio::test]
async fn test_interrupted_create_still_returns_location() {
    let (app, engine) = test_app();
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from("Hello")),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )),
    ];
    let resp = send(
        &app,
        Request::post("/")
            .header(INTEROP_VERSION, "4")
            .header(UPLOAD_COMPLETE, "?1")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("5"));
    assert_eq!(header_str(&resp, UPLOAD_COMPLETE), Some("?0"));
    let location = header_str(&resp, "location").unwrap().to_string();

    let resp = send(
        &app,
        Request::head(path_of(&location))
            .header(INTEROP_VERSION, "4")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, UPLOAD_OFFSET), Some("5"));

    let stored = engine.store().read(&id_of(&location)).await.unwrap();
    assert_eq!(stored, Some(Bytes::from("Hello")));
}

#[tokio::test]
async fn test_health_and_common_headers() {
    let (app, _) = test_app();
    let resp = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, "server"), Some("resumable-upload"));
    assert_eq!(header_str(&resp, "x-request-id").map(str::len), Some(16));
    assert!(resp.headers().contains_key(header::DATE));
    assert_eq!(body_text(resp).await, r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn test_openapi_document_lists_upload_routes() {
    let (app, _) = test_app();
    let resp = send(
        &app,
        Request::get("/openapi.json").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let doc: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert!(doc["paths"]["/"]["post"].is_object());
    assert!(doc["paths"]["/uploads/{id}"]["patch"].is_object());
    assert!(doc["paths"]["/uploads/{id}"]["head"].is_object());
    assert!(doc["paths"]["/uploads/{id}"]["delete"].is_object());
}

#[tokio::test]
async fn test_cors_exposes_protocol_headers() {
    let (app, _) = test_app();
    let resp = send(
        &app,
        Request::post("/")
            .header(header::ORIGIN, "https://app.example")
            .body(Body::from("a"))
            .unwrap(),
    )
    .await;
    assert_eq!(header_str(&resp, "access-control-allow-origin"), Some("*"));
    let exposed = header_str(&resp, "access-control-expose-headers")
        .unwrap()
        .to_ascii_lowercase();
    for name in ["location", UPLOAD_OFFSET, UPLOAD_INCOMPLETE, UPLOAD_COMPLETE] {
        assert!(exposed.contains(name), "{name} not exposed in {exposed}");
    }
}

#[tokio::test]
async fn test_metrics_route_absent_when_disabled() {
    let mut config = Config::default();
    config.observability.metrics = false;
    let (app, _) = test_app_with(config);
    let resp = send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
