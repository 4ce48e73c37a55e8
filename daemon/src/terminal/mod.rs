//! Browser-facing terminal: a WebSocket bridge into the PTY core.

mod decoder;

use axum::Router;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use deck_core::pty::TtyOptions;
use deck_core::pty::TtySize;
use deck_core::pty::spawn_tty;

use crate::config::AUTH_HEADER;
use crate::config::TOKEN_ENV;
use crate::session_id::generate_session_id;

pub use decoder::Utf8Decoder;

const TERM_NAME: &str = "xterm-256color";

/// Resize control message carried as a JSON text frame. Anything that fails
/// to parse as this shape is treated as keyboard input.
#[derive(Debug, Deserialize)]
struct WindowSize {
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    cols: u16,
}

#[derive(Clone, Default)]
struct TerminalState {
    token: Option<String>,
}

pub fn router() -> Router {
    let state = TerminalState {
        token: std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()),
    };
    Router::new()
        .route("/", get(index))
        .route("/ws", get(upgrade))
        .with_state(state)
}

/// Serves the terminal page and the WebSocket endpoint until the listener
/// fails.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "terminal server listening");
    axum::serve(listener, router()).await?;
    Ok(())
}

async fn index() -> impl IntoResponse {
    Html(include_str!("static/index.html"))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<TerminalState>,
) -> axum::response::Response {
    let sid = format!("WS-{}", generate_session_id());

    if let Some(expected) = &state.token {
        let presented = headers
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!(session = %sid, "unauthorized terminal connection attempt");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    info!(session = %sid, "new web terminal connection");
    ws.on_upgrade(move |socket| handle_socket(socket, sid))
}

async fn handle_socket(socket: WebSocket, sid: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(64);
    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
    let (resize_tx, resize_rx) = mpsc::channel::<TtySize>(1);
    let cancel = CancellationToken::new();

    // WebSocket -> PTY. Text frames that parse as a window size are control
    // messages; everything else is stdin.
    let input_task = tokio::spawn({
        let cancel = cancel.clone();
        let sid = sid.clone();
        async move {
            while let Some(message) = ws_rx.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(_) => break,
                };
                match message {
                    Message::Text(text) => {
                        if let Ok(size) = serde_json::from_str::<WindowSize>(&text) {
                            // Full slot means an older resize is pending;
                            // drop this one to stay responsive.
                            let _ = resize_tx.try_send(TtySize {
                                rows: size.rows,
                                cols: size.cols,
                            });
                            continue;
                        }
                        if input_tx.send(text.as_bytes().to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        if input_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            debug!(session = %sid, "closing websocket input loop");
            cancel.cancel();
        }
    });

    // PTY -> WebSocket, with fragment-safe UTF-8 decoding.
    let output_task = tokio::spawn({
        let cancel = cancel.clone();
        let sid = sid.clone();
        async move {
            let mut decoder = Utf8Decoder::new();
            while let Some(chunk) = output_rx.recv().await {
                let decoded = decoder.write(&chunk);
                if decoded.is_empty() {
                    continue;
                }
                if ws_tx.send(Message::Text(decoded.into())).await.is_err() {
                    warn!(session = %sid, "websocket write failed");
                    break;
                }
            }
            debug!(session = %sid, "closing websocket output loop");
            cancel.cancel();
            let _ = ws_tx.close().await;
        }
    });

    info!(session = %sid, "spawning shell for web terminal");
    let result = spawn_tty(TtyOptions {
        session_id: sid.clone(),
        work_dir: std::env::var("HOME").ok().map(Into::into),
        term: TERM_NAME.to_string(),
        env: Vec::new(),
        input: input_rx,
        output: output_tx,
        resize: resize_rx,
        cancel: cancel.clone(),
    })
    .await;

    // The output sender is gone only now, so buffered bytes drain to the
    // client before the socket closes.
    let _ = output_task.await;
    cancel.cancel();
    input_task.abort();

    match result {
        Ok(()) => info!(session = %sid, "web terminal session finished"),
        Err(err) => debug!(session = %sid, error = %err, "web terminal session ended"),
    }
}
