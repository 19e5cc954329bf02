//! End-to-end tests of the request pipeline through the HTTP router.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use folder_mock_server::metrics::{self, Outcome, RequestLabels};
use folder_mock_server::model::{FilePayload, Folder, FolderKey, HeaderRequirement, Mock, ResponseBody};
use folder_mock_server::{router, MemoryCatalog, MockServer, ServerConfig};
use http_body_util::BodyExt;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

fn app(catalog: Arc<MemoryCatalog>, config: ServerConfig) -> Router {
    let server = MockServer::new(config, catalog.clone(), catalog).unwrap();
    router(Arc::new(server))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_text(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

async fn catalog_with_folder(name: &str) -> Arc<MemoryCatalog> {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_folder(Folder::new(FolderKey::root(name))).await.unwrap();
    catalog
}

#[tokio::test]
async fn test_unmatched_request_is_404() {
    let catalog = Arc::new(MemoryCatalog::new());
    let app = app(catalog.clone(), ServerConfig::default());

    let request = Request::builder()
        .method("POST")
        .uri("/anything")
        .body(Body::from("{}"))
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(response).await, "No matching mock found");

    let logs = catalog.request_logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].folder.is_default_root());
    assert_eq!(logs[0].method, "POST");
}

#[tokio::test]
async fn test_folder_mock_with_query() {
    let catalog = catalog_with_folder("api").await;
    catalog
        .insert_mock(Mock::new(
            &FolderKey::root("api"),
            "GET",
            "/users?x=1",
            200,
            ResponseBody::Json(json!({"ok": true})),
        ))
        .await
        .unwrap();
    let app = app(catalog.clone(), ServerConfig::default());

    let response = send(&app, get("/api/users?x=1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, r#"{"ok":true}"#);

    let response = send(&app, get("/api/users?x=2")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let logs = catalog.request_logs().await;
    assert_eq!(logs[0].path, "/users");
    assert_eq!(logs[0].folder, FolderKey::root("api"));
}

#[tokio::test]
async fn test_required_header() {
    let catalog = Arc::new(MemoryCatalog::new());
    let mut mock = Mock::new(
        &FolderKey::default_root(),
        "GET",
        "/secure",
        200,
        ResponseBody::Json(json!("granted")),
    );
    mock.headers.insert(
        "X-Auth".to_string(),
        HeaderRequirement::Detailed {
            value: "t".to_string(),
            optional: false,
        },
    );
    catalog.insert_mock(mock).await.unwrap();
    let app = app(catalog, ServerConfig::default());

    let response = send(&app, get("/secure")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/secure")
        .header("x-auth", "t")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    assert_eq!(body_text(response).await, "granted");
}

#[tokio::test]
async fn test_body_contains_after_canonicalization() {
    let catalog = Arc::new(MemoryCatalog::new());
    let mut mock = Mock::new(
        &FolderKey::default_root(),
        "POST",
        "/items",
        201,
        ResponseBody::Json(json!({"created": true})),
    );
    mock.body_contains = Some(r#""id":42"#.to_string());
    mock.body_contains_required = true;
    catalog.insert_mock(mock).await.unwrap();
    let app = app(catalog, ServerConfig::default());

    let post = |body: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/items")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    };

    let response = send(&app, post(r#"{"id": 42, "name":"a"}"#)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, post("{}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_cache_replay_and_expiry() {
    let folder = "cache-scenario";
    let catalog = catalog_with_folder(folder).await;
    let mut mock = Mock::new(
        &FolderKey::root(folder),
        "GET",
        "/counter",
        200,
        ResponseBody::Json(json!({"n": 1, "at": "{query_t}"})),
    );
    mock.cache_enabled = true;
    mock.cache_ttl_seconds = Some(60);
    mock.response_headers
        .insert("X-Source".to_string(), "mock".to_string());
    catalog.insert_mock(mock).await.unwrap();
    let app = app(catalog.clone(), ServerConfig::default());

    let labels = RequestLabels {
        method: "GET",
        path: "/counter",
        folder,
    };
    let hits_before = metrics::request_count(labels, Outcome::MockHit, 200);

    let first = send(&app, get("/cache-scenario/counter?t=1")).await;
    let first_headers = first.headers().clone();
    let first_body = body_bytes(first).await;

    let second = send(&app, get("/cache-scenario/counter?t=1")).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers(), &first_headers);
    assert_eq!(body_bytes(second).await, first_body);

    assert_eq!(metrics::request_count(labels, Outcome::MockHit, 200), hits_before + 1.0);
    assert_eq!(metrics::request_count(labels, Outcome::CacheHit, 200), 1.0);

    tokio::time::advance(Duration::from_secs(61)).await;

    let third = send(&app, get("/cache-scenario/counter?t=1")).await;
    assert_eq!(body_bytes(third).await, first_body);
    assert_eq!(metrics::request_count(labels, Outcome::MockHit, 200), hits_before + 2.0);

    let logs = catalog.request_logs().await;
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|r| r.cache_ttl_seconds == Some(60)));
    assert!(logs[0].cache_key.as_deref().is_some_and(|k| k.ends_with(":GET:/counter?t=1")));
}

#[tokio::test]
async fn test_cache_keyed_by_query() {
    let catalog = Arc::new(MemoryCatalog::new());
    let mut mock = Mock::new(
        &FolderKey::default_root(),
        "GET",
        "/echo",
        200,
        ResponseBody::Json(json!("{query_v}")),
    );
    mock.cache_enabled = true;
    mock.cache_ttl_seconds = Some(60);
    catalog.insert_mock(mock).await.unwrap();
    let app = app(catalog, ServerConfig::default());

    assert_eq!(body_text(send(&app, get("/echo?v=a")).await).await, "a");
    assert_eq!(body_text(send(&app, get("/echo?v=b")).await).await, "b");
    assert_eq!(body_text(send(&app, get("/echo?v=a")).await).await, "a");
}

#[tokio::test]
async fn test_default_ttl_applies() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog
        .insert_mock(Mock::new(
            &FolderKey::default_root(),
            "GET",
            "/cached",
            200,
            ResponseBody::Json(json!({"n": 1})),
        ))
        .await
        .unwrap();
    let config = ServerConfig {
        default_cache_ttl_seconds: 30,
        ..Default::default()
    };
    let app = app(catalog.clone(), config);

    send(&app, get("/cached")).await;
    let logs = catalog.request_logs().await;
    assert_eq!(logs[0].cache_ttl_seconds, Some(30));
}

#[tokio::test]
async fn test_tie_break_by_display_order_then_id() {
    let catalog = Arc::new(MemoryCatalog::new());
    let folder = FolderKey::default_root();

    let mut late = Mock::new(&folder, "GET", "/dup", 200, ResponseBody::Json(json!("late")));
    late.display_order = 5;
    late.id = Uuid::from_u128(1);
    let mut high_id = Mock::new(&folder, "GET", "/dup", 200, ResponseBody::Json(json!("high")));
    high_id.display_order = 1;
    high_id.id = Uuid::from_u128(20);
    let mut low_id = Mock::new(&folder, "GET", "/dup", 200, ResponseBody::Json(json!("low")));
    low_id.display_order = 1;
    low_id.id = Uuid::from_u128(10);

    for mock in [late, high_id, low_id] {
        catalog.insert_mock(mock).await.unwrap();
    }
    let app = app(catalog, ServerConfig::default());

    assert_eq!(body_text(send(&app, get("/dup")).await).await, "low");
}

#[tokio::test]
async fn test_header_name_case_and_query_order() {
    let catalog = Arc::new(MemoryCatalog::new());
    let mut mock = Mock::new(
        &FolderKey::default_root(),
        "get",
        "/search?a=1&b=2",
        200,
        ResponseBody::Json(json!({"hit": true})),
    );
    mock.headers
        .insert("x-tenant".to_string(), HeaderRequirement::Literal("acme".to_string()));
    catalog.insert_mock(mock).await.unwrap();
    let app = app(catalog, ServerConfig::default());

    let request = Request::builder()
        .uri("/search?b=2&a=1")
        .header("X-TENANT", "acme")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_file_payload_download() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog
        .insert_mock(Mock::new(
            &FolderKey::default_root(),
            "GET",
            "/report",
            200,
            ResponseBody::File(FilePayload {
                content_base64: "JVBERi0xLjQ=".to_string(),
                mime_type: "application/pdf".to_string(),
                filename: "rapport-été.pdf".to_string(),
            }),
        ))
        .await
        .unwrap();
    let app = app(catalog, ServerConfig::default());

    let response = send(&app, get("/report")).await;
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename*=UTF-8''rapport-%C3%A9t%C3%A9.pdf"
    );
    assert_eq!(body_bytes(response).await, b"%PDF-1.4");
}

#[tokio::test]
async fn test_subfolder_resolution() {
    let catalog = catalog_with_folder("shop").await;
    catalog
        .insert_folder(Folder::new(FolderKey::child("v2", "shop")))
        .await
        .unwrap();
    catalog
        .insert_mock(Mock::new(
            &FolderKey::child("v2", "shop"),
            "GET",
            "/cart",
            200,
            ResponseBody::Json(json!("v2 cart")),
        ))
        .await
        .unwrap();
    catalog
        .insert_mock(Mock::new(
            &FolderKey::root("shop"),
            "GET",
            "/v3/cart",
            200,
            ResponseBody::Json(json!("root cart")),
        ))
        .await
        .unwrap();
    let app = app(catalog, ServerConfig::default());

    assert_eq!(body_text(send(&app, get("/shop/v2/cart")).await).await, "v2 cart");
    assert_eq!(body_text(send(&app, get("/shop/v3/cart")).await).await, "root cart");
    assert_eq!(send(&app, get("/v2/cart")).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_percent_encoded_paths_and_folders() {
    let catalog = catalog_with_folder("données").await;
    for (path, body) in [("/café", "coffee"), ("/a b", "spaced")] {
        catalog
            .insert_mock(Mock::new(
                &FolderKey::default_root(),
                "GET",
                path,
                200,
                ResponseBody::Json(json!(body)),
            ))
            .await
            .unwrap();
    }
    catalog
        .insert_mock(Mock::new(
            &FolderKey::root("données"),
            "GET",
            "/x",
            200,
            ResponseBody::Json(json!("{method} {path}")),
        ))
        .await
        .unwrap();
    let app = app(catalog.clone(), ServerConfig::default());

    assert_eq!(body_text(send(&app, get("/caf%C3%A9")).await).await, "coffee");
    assert_eq!(body_text(send(&app, get("/a%20b")).await).await, "spaced");
    assert_eq!(
        body_text(send(&app, get("/donn%C3%A9es/x")).await).await,
        "GET /donn%C3%A9es/x"
    );

    let logs = catalog.request_logs().await;
    assert_eq!(logs[0].path, "/café");
    assert_eq!(logs[2].folder, FolderKey::root("données"));
    assert_eq!(logs[2].path, "/x");
}

#[tokio::test]
async fn test_rate_limit_rejects_with_429() {
    let catalog = Arc::new(MemoryCatalog::new());
    let config = ServerConfig {
        rate_limit_requests: 2,
        rate_limit_window_seconds: 60,
        ..Default::default()
    };
    let app = app(catalog.clone(), config);

    for _ in 0..2 {
        assert_eq!(send(&app, get("/limited")).await.status(), StatusCode::NOT_FOUND);
    }
    let response = send(&app, get("/limited")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_text(response).await, "Too Many Requests");
    assert_eq!(catalog.request_logs().await.len(), 2);
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let catalog = Arc::new(MemoryCatalog::new());
    let config = ServerConfig {
        max_request_body_bytes: 8,
        ..Default::default()
    };
    let app = app(catalog.clone(), config);

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(catalog.request_logs().await.is_empty());
}

#[tokio::test]
async fn test_probes() {
    let catalog = Arc::new(MemoryCatalog::new());
    let app = app(catalog, ServerConfig::default());

    let response = send(&app, get("/healthz")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");

    let response = send(&app, get("/readyz")).await;
    assert_eq!(response.status(), StatusCode::OK);

    send(&app, get("/probe-metrics-warmup")).await;
    let response = send(&app, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("mock_server_requests_total"));
}

#[tokio::test]
async fn test_catalog_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
folders:
  - name: files
mocks:
  - folder_name: files
    method: GET
    path: /hello/
    status_code: 202
    response_headers:
      X-Greeting: "hi {{header_x_user}}"
    response_body: "hello {{query_name}}"
"#
    )
    .unwrap();

    let catalog = Arc::new(MemoryCatalog::from_file(file.path()).unwrap());
    let app = app(catalog, ServerConfig::default());

    let request = Request::builder()
        .uri("/files/hello?name=bo")
        .header("X-User", "ann")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-greeting"], "hi ann");
    assert_eq!(body_text(response).await, "hello bo");
}
