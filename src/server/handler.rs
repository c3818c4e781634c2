use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes as ByteBuf;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ServerError;
use crate::headers::{CHUNK_SIZE, CLOSE_HEADER, CONN_ID_HEADER, ORIGIN_HEADER, SERVER_URL_HEADER};
use crate::id::ConnectionId;

use super::{ConnEntry, HandlerState, Registry};

pub(super) fn router(state: Arc<HandlerState>) -> Router {
    Router::new().route("/", post(tunnel)).with_state(state)
}

fn status_response(code: StatusCode) -> Response {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .expect("building a status-only response never fails")
}

async fn tunnel(State(state): State<Arc<HandlerState>>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        let conn_id = parse_conn_id(&headers).ok_or(ServerError::MissingConnId)?;

        if let Some(entry) = state.registry.get(&conn_id) {
            handle_subsequent(&state, conn_id, entry, &headers, body).await
        } else {
            handle_first(&state, conn_id, &headers, body).await
        }
    }
    .await;

    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn parse_conn_id(headers: &HeaderMap) -> Option<ConnectionId> {
    let raw = headers.get(CONN_ID_HEADER)?.to_str().ok()?;
    ConnectionId::parse(raw).ok()
}

async fn handle_subsequent(
    state: &HandlerState,
    conn_id: ConnectionId,
    entry: Arc<ConnEntry>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    if headers.contains_key(CLOSE_HEADER) {
        entry.cancel();
        state.registry.remove(&conn_id);
        log::info!(target: "enhttp::server", "closed connection {conn_id} at client's request");
        return Ok(status_response(StatusCode::OK));
    }

    if let Err(e) = entry.write_all(&body).await {
        log::warn!(target: "enhttp::server", "write to upstream failed for {conn_id}: {e}");
        entry.cancel();
        state.registry.remove(&conn_id);
        return Err(ServerError::UpstreamWrite(e));
    }

    entry.touch();
    Ok(status_response(StatusCode::OK))
}

async fn handle_first(
    state: &HandlerState,
    conn_id: ConnectionId,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let origin = headers
        .get(ORIGIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(ServerError::MissingOrigin)?;

    let stream = TcpStream::connect(&origin).await.map_err(|source| {
        log::warn!(target: "enhttp::server", "dial {origin} failed for {conn_id}: {source}");
        ServerError::Dial { origin: origin.clone(), source }
    })?;
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();

    if !body.is_empty() {
        use tokio::io::AsyncWriteExt;
        write_half.write_all(&body).await.map_err(|e| {
            log::warn!(target: "enhttp::server", "initial write to {origin} failed for {conn_id}: {e}");
            ServerError::UpstreamWrite(e)
        })?;
    }

    let entry = Arc::new(ConnEntry::new(write_half));
    state.registry.insert(conn_id, entry.clone());

    let (body_tx, body_rx) = mpsc::channel::<std::io::Result<ByteBuf>>(1);
    let registry = state.registry.clone();
    tokio::spawn(pump_upstream(conn_id, read_half, entry, registry, body_tx));

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
    *response.status_mut() = StatusCode::OK;
    let resp_headers = response.headers_mut();
    resp_headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    resp_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(url) = state.sticky_url.as_deref().filter(|u| !u.is_empty()) {
        if let Ok(v) = HeaderValue::from_str(url) {
            resp_headers.insert(SERVER_URL_HEADER, v);
        }
    }
    Ok(response)
}

async fn pump_upstream(
    conn_id: ConnectionId,
    mut read_half: OwnedReadHalf,
    entry: Arc<ConnEntry>,
    registry: Registry,
    tx: mpsc::Sender<std::io::Result<ByteBuf>>,
) {
    let cancel = entry.cancellation();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!(target: "enhttp::server", "pump for {conn_id} cancelled");
                break;
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        log::debug!(target: "enhttp::server", "origin closed connection {conn_id}");
                        break;
                    }
                    Ok(n) => {
                        entry.touch();
                        if tx.send(Ok(ByteBuf::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!(target: "enhttp::server", "upstream read error for {conn_id}: {e}");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        }
    }

    registry.remove(&conn_id);
}
