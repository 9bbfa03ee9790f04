//! HTTP + websocket front end. Serves the current rendered page, fans
//! server messages out to every connected browser, forwards inbound
//! client frames to the coordinator, and binds the first free port in a
//! configured range.

use crate::error::{BindError, ProtocolError, TransportError};
use crate::wire::{ClientMessage, ServerMessage};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, Mutex};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

struct AppState {
    page_html: Mutex<String>,
    outgoing: broadcast::Sender<ServerMessage>,
    incoming: mpsc::UnboundedSender<ClientMessage>,
    next_connection_id: AtomicU64,
}

/// Owns the cached page and the fan-out channel; handed to the
/// coordinator to push messages, and to axum as shared request state.
pub struct Transport {
    state: Arc<AppState>,
    static_dir: Option<std::path::PathBuf>,
}

impl Transport {
    /// `incoming` receives every well-formed frame from every connected
    /// browser; a frame that fails to parse is logged and the connection
    /// is dropped (unknown `kind` is a protocol error per the wire spec).
    pub fn new(
        initial_page: String,
        static_dir: Option<std::path::PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outgoing, _rx) = broadcast::channel(256);
        let (incoming, incoming_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(AppState {
                    page_html: Mutex::new(initial_page),
                    outgoing,
                    incoming,
                    next_connection_id: AtomicU64::new(0),
                }),
                static_dir,
            },
            incoming_rx,
        )
    }

    /// Replace the full cached page (served to new connections and on
    /// plain reload) without necessarily pushing a fragment.
    pub async fn set_page(&self, page_html: String) {
        *self.state.page_html.lock().await = page_html;
    }

    /// Broadcast a message to every connected browser. `send` only fails
    /// with zero subscribers, which is not an error here.
    pub fn broadcast(&self, message: ServerMessage) {
        let _ = self.state.outgoing.send(message);
    }

    fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/", get(index))
            .route("/ws", get(ws_handler));

        if let Some(dir) = &self.static_dir {
            router = router.nest_service("/static", ServeDir::new(dir));
        }

        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the first free port in `start..=end` on `host` and serve until
    /// the passed-in future resolves (typically a shutdown signal).
    pub async fn serve(
        &self,
        host: &str,
        start: u16,
        end: u16,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<u16, BindError> {
        let (listener, port) = bind_in_range(host, start, end).await?;
        tracing::info!(%host, port, "knitj listening");

        let app = self.router();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(%err, "server task exited with an error");
            }
        });

        Ok(port)
    }
}

async fn bind_in_range(host: &str, start: u16, end: u16) -> Result<(TcpListener, u16), BindError> {
    for port in start..=end {
        if let Ok(listener) = try_bind((host.to_string(), port)).await {
            return Ok((listener, port));
        }
    }
    Err(BindError { start, end })
}

async fn try_bind(addr: impl ToSocketAddrs) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Html(state.page_html.lock().await.clone())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let mut outgoing = state.outgoing.subscribe();

    loop {
        tokio::select! {
            sent = outgoing.recv() => {
                match sent {
                    Ok(message) => {
                        let payload = serde_json::to_string(&message).unwrap_or_default();
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            log_transport_error(id, "failed to write to socket");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log_transport_error(id, "broadcast channel closed");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if state.incoming.send(msg).is_err() {
                                    log_transport_error(id, "coordinator channel closed");
                                    break;
                                }
                            }
                            Err(err) => {
                                let protocol_err = ProtocolError::UnknownFrameKind {
                                    kind: err.to_string(),
                                };
                                tracing::warn!(%protocol_err, frame = %text, "dropping malformed websocket frame");
                                log_transport_error(id, "malformed websocket frame");
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log_transport_error(id, &err.to_string());
                        break;
                    }
                    None => {
                        log_transport_error(id, "socket closed by peer");
                        break;
                    }
                }
            }
        }
    }
}

fn log_transport_error(id: u64, reason: &str) {
    let err = TransportError {
        id,
        reason: reason.to_string(),
    };
    tracing::warn!(%err, "websocket peer disconnected");
}
