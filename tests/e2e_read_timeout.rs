//! A `Read` with a deadline in the past (or one that elapses while
//! waiting) fails with a timeout-classified error instead of hanging
//! forever, even though the origin never sends anything back.

#![cfg(feature = "e2e")]

use std::time::{Duration, SystemTime};

use enhttp::{Dialer, ServerConfig, ServerHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_silent_origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            std::mem::forget(socket);
        }
    });
    addr
}

async fn spawn_tunnel_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = ServerHandler::new(ServerConfig::default());
    let app = handler.router();
    tokio::spawn(async move {
        let _handler = handler;
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn read_past_its_deadline_times_out() {
    let origin_addr = spawn_silent_origin().await;
    let server_url = spawn_tunnel_server().await;

    let dialer = Dialer::new(reqwest::Client::new(), server_url);
    let mut conn = dialer.dial(origin_addr.to_string());

    conn.write_all(b"ping").await.expect("write dials origin");
    conn.set_read_deadline(SystemTime::now() + Duration::from_millis(100));

    let mut buf = [0u8; 16];
    let err = conn.read(&mut buf).await.expect_err("origin never replies, read should time out");
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn deadline_already_past_fails_immediately() {
    let origin_addr = spawn_silent_origin().await;
    let server_url = spawn_tunnel_server().await;

    let dialer = Dialer::new(reqwest::Client::new(), server_url);
    let mut conn = dialer.dial(origin_addr.to_string());
    conn.write_all(b"ping").await.expect("write dials origin");

    conn.set_read_deadline(SystemTime::now() - Duration::from_secs(1));

    let mut buf = [0u8; 16];
    let err = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .expect("should not need to wait for an already-past deadline")
        .expect_err("already past deadline");
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}
