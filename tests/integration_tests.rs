//! End-to-end gateway tests
//!
//! Each test starts an echo backend and a gateway on ephemeral ports, then
//! drives the gateway over HTTP:
//! 1. Public forwarding with path expansion and query relay
//! 2. Credential validation and trusted identity headers
//! 3. Per-client admission control
//! 4. Route table and upstream failures

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use storefront_gateway::config::{Config, RouteConfig};
use storefront_gateway::gateway::Gateway;

const SECRET: &str = "integration-secret";

/// Requests seen by the echo backend
#[derive(Clone, Default)]
struct Hits(Arc<AtomicUsize>);

impl Hits {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Echo the request back as JSON
async fn echo(
    State(hits): State<Hits>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect::<Vec<_>>()
    };

    let status = if method == Method::POST {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    (
        status,
        [("x-backend", "echo")],
        Json(json!({
            "method": method.as_str(),
            "uri": uri.to_string(),
            "x_user_id": header("x-user-id"),
            "x_user_email": header("x-user-email"),
            "x_forwarded_host": header("x-forwarded-host"),
            "body": String::from_utf8_lossy(&body),
        })),
    )
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(2)).await;
    "late"
}

async fn spawn_backend() -> (SocketAddr, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/slow", get(slow))
        .fallback(echo)
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn test_config(backend: SocketAddr) -> Config {
    let base = format!("http://{backend}");
    let mut config = Config::default();
    config.env_files.clear();
    config.auth.jwt_secret = SECRET.to_string();
    config.services = HashMap::from([
        ("auth".to_string(), base.clone()),
        ("products".to_string(), base.clone()),
        ("cart".to_string(), base.clone()),
        ("orders".to_string(), base),
    ]);
    config
}

async fn spawn_gateway(config: Config) -> String {
    let gateway = Gateway::new(config).unwrap();
    let app = gateway.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn token(id: i64, email: &str, alg: Algorithm, secret: &str, exp_offset: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        .cast_signed();
    encode(
        &Header::new(alg),
        &json!({"id": id, "email": email, "name": "Tester", "exp": now + exp_offset}),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn valid_token(id: i64) -> String {
    token(id, "user@example.com", Algorithm::HS256, SECRET, 3600)
}

// ============================================================================
// Public forwarding
// ============================================================================

#[tokio::test]
async fn public_product_lookup_is_forwarded_without_identity() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;

    let response = Client::new()
        .get(format!("{gateway}/api/products/42?fields=name"))
        .header("x-user-id", "999")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-backend"], "echo");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["uri"], "/products/42?fields=name");
    assert_eq!(body["x_user_id"], json!([]));
    assert_eq!(body["x_user_email"], json!([]));
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn anonymous_catalog_reads_are_not_throttled() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;
    let client = Client::new();

    for _ in 0..10 {
        let response = client
            .get(format!("{gateway}/api/products"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(hits.count(), 10);
}

#[tokio::test]
async fn login_body_and_status_are_relayed() {
    let (backend, _) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;

    let response = Client::new()
        .post(format!("{gateway}/api/login"))
        .header("content-type", "application/json")
        .body(r#"{"email":"a@b.com","password":"pw"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["uri"], "/login");
    assert_eq!(body["body"], r#"{"email":"a@b.com","password":"pw"}"#);
    assert_eq!(body["x_forwarded_host"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn health_reports_ok() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;

    let response = Client::new()
        .get(format!("{gateway}/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(hits.count(), 0);
}

// ============================================================================
// Credential validation
// ============================================================================

#[tokio::test]
async fn protected_route_injects_verified_identity() {
    let (backend, _) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;

    let response = Client::new()
        .post(format!("{gateway}/api/cart/abc123"))
        .bearer_auth(valid_token(7))
        .header("x-user-id", "999")
        .header("x-user-email", "attacker@example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["uri"], "/cart/abc123");
    assert_eq!(body["x_user_id"], json!(["7"]));
    assert_eq!(body["x_user_email"], json!(["user@example.com"]));
}

#[tokio::test]
async fn missing_credential_is_rejected_before_forwarding() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;

    let response = Client::new()
        .get(format!("{gateway}/api/orders"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "Bearer");
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
    assert_eq!(hits.count(), 0);
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;
    let client = Client::new();

    let cases = [
        token(7, "user@example.com", Algorithm::HS256, "other-secret", 3600),
        token(7, "user@example.com", Algorithm::HS256, SECRET, -3600),
        "not-a-jwt".to_string(),
    ];

    for credential in cases {
        let response = client
            .get(format!("{gateway}/api/cart"))
            .bearer_auth(&credential)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{credential}");
    }

    let response = client
        .get(format!("{gateway}/api/cart"))
        .header("authorization", format!("Basic {}", valid_token(7)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(hits.count(), 0);
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test]
async fn exhausted_bucket_returns_429_without_forwarding() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;
    let client = Client::new();
    let credential = valid_token(7);

    for _ in 0..5 {
        let response = client
            .post(format!("{gateway}/api/cart/abc123"))
            .bearer_auth(&credential)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = client
        .post(format!("{gateway}/api/cart/abc123"))
        .bearer_auth(&credential)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["retry_after"], retry_after);
    assert_eq!(hits.count(), 5);

    // Another client still has a full bucket
    let response = client
        .get(format!("{gateway}/api/cart"))
        .bearer_auth(valid_token(8))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.count(), 6);
}

#[tokio::test]
async fn invalid_credentials_do_not_consume_tokens() {
    let (backend, _) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;
    let client = Client::new();

    for _ in 0..10 {
        let response = client
            .get(format!("{gateway}/api/cart"))
            .bearer_auth("garbage")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = client
        .get(format!("{gateway}/api/cart"))
        .bearer_auth(valid_token(7))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn disabled_rate_limit_admits_everything() {
    let (backend, hits) = spawn_backend().await;
    let mut config = test_config(backend);
    config.rate_limit.enabled = false;
    let gateway = spawn_gateway(config).await;
    let client = Client::new();
    let credential = valid_token(7);

    for _ in 0..8 {
        let response = client
            .get(format!("{gateway}/api/orders"))
            .bearer_auth(&credential)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(hits.count(), 8);
}

// ============================================================================
// Route table and upstream failures
// ============================================================================

#[tokio::test]
async fn unknown_service_yields_502() {
    let (backend, hits) = spawn_backend().await;
    let mut config = test_config(backend);
    config.routes.push(RouteConfig::new(
        "GET",
        "/api/inventory",
        "inventory",
        "/inventory",
        false,
    ));
    let gateway = spawn_gateway(config).await;

    let response = Client::new()
        .get(format!("{gateway}/api/inventory"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Service not found");
    assert_eq!(hits.count(), 0);
}

#[tokio::test]
async fn unreachable_backend_yields_502() {
    // Bind then drop to get a port nothing listens on
    let closed = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let gateway = spawn_gateway(test_config(closed)).await;

    let response = Client::new()
        .get(format!("{gateway}/api/products"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Upstream service unavailable");
}

#[tokio::test]
async fn slow_backend_yields_504() {
    let (backend, _) = spawn_backend().await;
    let mut config = test_config(backend);
    config.server.request_timeout = Duration::from_millis(200);
    config
        .routes
        .push(RouteConfig::new("GET", "/api/slow", "products", "/slow", false));
    let gateway = spawn_gateway(config).await;

    let response = Client::new()
        .get(format!("{gateway}/api/slow"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn oversized_body_yields_413() {
    let (backend, hits) = spawn_backend().await;
    let mut config = test_config(backend);
    config.server.max_body_size = 16;
    let gateway = spawn_gateway(config).await;

    let response = Client::new()
        .post(format!("{gateway}/api/register"))
        .body("x".repeat(64))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(hits.count(), 0);
}

/// Send `body` with chunked transfer encoding and return the raw response
async fn post_chunked(gateway: &str, path: &str, body: &[u8]) -> String {
    let addr = gateway.trim_start_matches("http://");
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    )
    .into_bytes();
    for chunk in body.chunks(16) {
        request.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        request.extend_from_slice(chunk);
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"0\r\n\r\n");
    stream.write_all(&request).await.unwrap();

    // The gateway may reset the connection after rejecting the body
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn oversized_chunked_body_yields_413() {
    let (backend, hits) = spawn_backend().await;
    let mut config = test_config(backend);
    config.server.max_body_size = 16;
    let gateway = spawn_gateway(config).await;

    let response = post_chunked(&gateway, "/api/register", &[b'x'; 64]).await;

    assert!(response.starts_with("HTTP/1.1 413"), "{response}");
    assert_eq!(hits.count(), 0);
}

#[tokio::test]
async fn chunked_body_within_limit_is_forwarded() {
    let (backend, hits) = spawn_backend().await;
    let mut config = test_config(backend);
    config.server.max_body_size = 64;
    let gateway = spawn_gateway(config).await;

    let response = post_chunked(&gateway, "/api/register", &[b'y'; 40]).await;

    assert!(response.starts_with("HTTP/1.1 201"), "{response}");
    assert!(response.contains(&"y".repeat(40)), "{response}");
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn unregistered_path_is_404() {
    let (backend, hits) = spawn_backend().await;
    let gateway = spawn_gateway(test_config(backend)).await;

    let response = Client::new()
        .get(format!("{gateway}/api/unknown"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(hits.count(), 0);
}
