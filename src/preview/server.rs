//! HTTP server exposing the live preview WebSocket

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use super::protocol::{ClientMessage, ProtocolError, ServerMessage};
use super::streamer::PreviewStreamer;

/// Outbound frames buffered per connection before a preview waits on the client
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Requests held back while a preview runs; further ones are refused
pub const MAX_QUEUED_REQUESTS: usize = 16;

/// Which browser origins may open a preview socket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginPolicy {
    #[default]
    AllowAll,
    AllowList(Vec<String>),
}

impl OriginPolicy {
    pub fn from_list(origins: Vec<String>) -> Self {
        if origins.is_empty() {
            OriginPolicy::AllowAll
        } else {
            OriginPolicy::AllowList(origins)
        }
    }

    /// Requests without an Origin header come from non-browser clients
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (OriginPolicy::AllowAll, _) | (_, None) => true,
            (OriginPolicy::AllowList(allowed), Some(origin)) => {
                let origin = origin.trim_end_matches('/');
                allowed
                    .iter()
                    .any(|a| a.trim_end_matches('/').eq_ignore_ascii_case(origin))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreviewConfig {
    pub origin_policy: OriginPolicy,
}

#[derive(Clone)]
struct AppState {
    streamer: Arc<PreviewStreamer>,
    origins: Arc<OriginPolicy>,
}

/// Build the preview router
pub fn router(streamer: Arc<PreviewStreamer>, config: PreviewConfig) -> Router {
    let state = AppState {
        streamer,
        origins: Arc::new(config.origin_policy),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/preview", get(ws_handler))
        .fallback(not_found)
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<AppState>) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.origins.allows(origin) {
        log::warn!("Rejected preview connection from origin {:?}", origin);
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state.streamer))
}

/// One connection: requests are handled one at a time. While a preview runs,
/// pings are answered right away and up to [`MAX_QUEUED_REQUESTS`] other
/// requests wait their turn.
async fn handle_socket(socket: WebSocket, streamer: Arc<PreviewStreamer>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    let mut pending: VecDeque<String> = VecDeque::new();
    'conn: loop {
        let text = match pending.pop_front() {
            Some(text) => text,
            None => match receiver.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("WebSocket read failed: {}", e);
                    break;
                }
            },
        };

        let request = match ClientMessage::parse(&text) {
            Ok(ClientMessage::Ping) => {
                let _ = tx.send(ServerMessage::Pong).await;
                continue;
            }
            Ok(ClientMessage::Preview(request)) => request,
            Err(e) => {
                log::debug!("Rejected preview frame: {:?}", e);
                let _ = tx.send(ServerMessage::error(e)).await;
                continue;
            }
        };

        let preview = streamer.run(request, &tx);
        tokio::pin!(preview);
        loop {
            tokio::select! {
                _ = &mut preview => break,
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str().to_owned();
                        if matches!(ClientMessage::parse(&text), Ok(ClientMessage::Ping)) {
                            let _ = tx.send(ServerMessage::Pong).await;
                        } else if pending.len() >= MAX_QUEUED_REQUESTS {
                            log::warn!("Preview connection over its request backlog, refusing frame");
                            let _ = tx.send(ServerMessage::error(ProtocolError::Backlog)).await;
                        } else {
                            pending.push_back(text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        log::info!("Preview connection closed, abandoning run");
                        break 'conn;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}

/// Handle to a running preview server
pub struct RunningServer {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RunningServer {
    /// Stop the server gracefully
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }

    /// Serve until the task ends
    pub async fn wait(self) {
        let _ = self.handle.await;
    }
}

pub struct PreviewServer;

impl PreviewServer {
    /// Bind and start serving in the background
    pub async fn start(
        bind: &str,
        streamer: Arc<PreviewStreamer>,
        config: PreviewConfig,
    ) -> std::io::Result<RunningServer> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        log::info!("Preview server listening on {}", addr);

        let (shutdown_tx, mut shutdown) = broadcast::channel::<()>(1);
        let app = router(streamer, config);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
            {
                log::error!("Preview server error: {}", e);
            }
        });

        Ok(RunningServer {
            addr,
            handle,
            shutdown_tx,
        })
    }
}
