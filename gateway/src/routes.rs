use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use socket_registry::{ChannelConnection, Connection, SocketId, SocketManager, METRICS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;

/// Upper bound on flushing queued replies after the read side closes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppState {
    pub manager: Arc<SocketManager>,
    pub dispatcher: Dispatcher,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /metrics - Prometheus-formatted counters
async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.to_prometheus(),
    )
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub id: Option<String>,
}

/// GET /ws?id=<clientId>
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.id, state))
}

async fn handle_socket(mut socket: WebSocket, client_id: Option<String>, state: Arc<AppState>) {
    let socket_id = SocketId::new();

    let Some(client_id) = client_id.filter(|id| !id.trim().is_empty()) else {
        tracing::warn!(%socket_id, "WebSocket connection rejected: missing or invalid 'id' query parameter");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "Missing or invalid 'id' query parameter".into(),
            })))
            .await;
        return;
    };

    let (mut sink, mut stream) = socket.split();
    let (conn, outbound) = ChannelConnection::new(socket_id);

    if let Err(e) = state.manager.on_open(conn.clone(), &client_id).await {
        tracing::error!(%socket_id, client_id = %client_id, "Failed to open socket: {}", e);
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: "Connection setup failed".into(),
            })))
            .await;
        return;
    }

    // Single writer so replies and relayed messages never interleave mid-frame
    let writer = tokio::spawn(write_outbound(sink, outbound, socket_id));

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = state
                    .dispatcher
                    .dispatch(&state.manager, &*conn, &text)
                    .await;
                if let Err(e) = conn.send(&reply).await {
                    tracing::debug!(%socket_id, "Reply not sent: {}", e);
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%socket_id, "WebSocket read failed: {}", e);
                break;
            }
        }
    }

    conn.close();
    if let Err(e) = state.manager.on_close(&*conn, &client_id).await {
        tracing::error!(%socket_id, client_id = %client_id, "Failed to close socket: {}", e);
    }

    drain_writer(conn, writer).await;
}

/// Forward queued text frames to the socket until every sender is gone,
/// then close the sink.
async fn write_outbound<S>(mut sink: S, mut outbound: UnboundedReceiver<String>, socket_id: SocketId)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(text) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::debug!(%socket_id, "WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

/// Let the writer flush replies still queued for the socket, then close
/// the sink. Gives up after [`WRITER_DRAIN_TIMEOUT`].
async fn drain_writer(conn: Arc<ChannelConnection>, writer: JoinHandle<()>) {
    let socket_id = conn.id();
    // The writer ends once every sender is gone; the local table dropped its
    // handle in on_close.
    drop(conn);

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!(%socket_id, "Writer did not drain in time, aborting");
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use socket_registry::MemoryStore;
    use tower::ServiceExt;

    fn app() -> Router {
        let manager = Arc::new(SocketManager::new(Arc::new(MemoryStore::new())));
        router(Arc::new(AppState {
            manager,
            dispatcher: crate::handlers::dispatcher(),
        }))
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_content_type() {
        let response = app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_queued_replies_are_flushed_on_disconnect() {
        let socket_id = SocketId::new();
        let (conn, outbound) = ChannelConnection::new(socket_id);
        conn.send("first").await.unwrap();
        conn.send("second").await.unwrap();
        conn.close();

        let (sent_tx, mut sent_rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = Box::pin(futures_util::sink::unfold(sent_tx, |tx, msg: Message| async move {
            let _ = tx.send(msg);
            Ok::<_, std::convert::Infallible>(tx)
        }));
        let writer = tokio::spawn(write_outbound(sink, outbound, socket_id));

        drain_writer(conn, writer).await;

        assert_eq!(sent_rx.recv().await, Some(Message::Text("first".to_string())));
        assert_eq!(sent_rx.recv().await, Some(Message::Text("second".to_string())));
        assert_eq!(sent_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let response = app()
            .oneshot(Request::builder().uri("/ws?id=device-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
