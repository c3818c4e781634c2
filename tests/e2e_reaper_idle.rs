//! A connection that goes quiet longer than the configured idle timeout
//! gets reaped: its upstream socket closes and the registry forgets it,
//! without any explicit close from the client.

#![cfg(feature = "e2e")]

use std::time::Duration;

use enhttp::{Dialer, ServerConfig, ServerHandler};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

async fn spawn_silent_origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            // Accept and hold the connection open without ever writing
            // back, so the only way it closes is via the reaper.
            std::mem::forget(socket);
        }
    });
    addr
}

#[tokio::test]
async fn idle_connection_is_reaped_and_forgotten() {
    let origin_addr = spawn_silent_origin().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = ServerHandler::new(ServerConfig {
        idle_timeout_secs: 0, // any inactivity counts as stale, for a fast test
        ..ServerConfig::default()
    });
    let app = handler.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let dialer = Dialer::new(reqwest::Client::new(), format!("http://{addr}/"));
    let mut conn = dialer.dial(origin_addr.to_string());
    conn.write_all(b"hi").await.expect("initial write dials origin");

    // Give the reaper tick(s) time to run and sweep the now-idle entry.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handler.connection_count(), 0, "reaper should have removed the idle connection");
}
