//! Direct HTTP-level checks of the server's error handling, bypassing
//! `VirtualConn` so malformed/missing headers can be sent deliberately.

#![cfg(feature = "e2e")]

use enhttp::ServerConfig;
use tokio::net::TcpListener;

async fn spawn_tunnel_server() -> (String, enhttp::ServerHandler) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = enhttp::ServerHandler::new(ServerConfig::default());
    let app = handler.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/"), handler)
}

#[tokio::test]
async fn missing_connection_id_is_rejected() {
    let (server_url, _handler) = spawn_tunnel_server().await;

    let resp = reqwest::Client::new()
        .post(&server_url)
        .body("whatever")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_connection_id_is_rejected() {
    let (server_url, _handler) = spawn_tunnel_server().await;

    let resp = reqwest::Client::new()
        .post(&server_url)
        .header("X-En-Conn-Id", "not-a-ulid")
        .header("X-Origin", "127.0.0.1:1")
        .body("whatever")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn first_post_without_origin_is_rejected() {
    let (server_url, _handler) = spawn_tunnel_server().await;
    let conn_id = ulid::Ulid::new().to_string();

    let resp = reqwest::Client::new()
        .post(&server_url)
        .header("X-En-Conn-Id", conn_id)
        .body("whatever")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unreachable_origin_yields_bad_gateway() {
    let (server_url, _handler) = spawn_tunnel_server().await;
    let conn_id = ulid::Ulid::new().to_string();

    // Port 1 is privileged and not listening; the dial should fail fast.
    let resp = reqwest::Client::new()
        .post(&server_url)
        .header("X-En-Conn-Id", conn_id)
        .header("X-Origin", "127.0.0.1:1")
        .body("whatever")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn get_requests_are_not_accepted() {
    let (server_url, _handler) = spawn_tunnel_server().await;

    let resp = reqwest::Client::new().get(&server_url).send().await.unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}
