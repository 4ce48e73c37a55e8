//! HTTP control plane for the sandbox: command execution plus the desktop
//! supervisor's lifecycle, status and browser operations.

mod computeruse;
mod process;

use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use tracing::info;
use tracing::warn;

use deck_core::reap::ProcessRegistry;
use deck_desktop::DesktopSupervisor;

use crate::config::AUTH_HEADER;
use crate::config::TOKEN_ENV;

#[derive(Clone)]
pub struct ToolboxState {
    pub registry: Arc<ProcessRegistry>,
    pub desktop: Arc<DesktopSupervisor>,
    token: Option<String>,
}

#[cfg(test)]
impl ToolboxState {
    pub(crate) fn for_tests(
        registry: Arc<ProcessRegistry>,
        desktop: Arc<DesktopSupervisor>,
    ) -> Self {
        Self {
            registry,
            desktop,
            token: None,
        }
    }
}

/// JSON error body with the matching HTTP status.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

pub fn router(registry: Arc<ProcessRegistry>, desktop: Arc<DesktopSupervisor>) -> Router {
    let state = ToolboxState {
        registry,
        desktop,
        token: std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()),
    };

    Router::new()
        .route("/process/execute", post(process::execute_command))
        .route("/computeruse/start", post(computeruse::start))
        .route("/computeruse/stop", post(computeruse::stop))
        .route("/computeruse/status", get(computeruse::status))
        .route("/computeruse/process-status", get(computeruse::process_status))
        .route(
            "/computeruse/process/{name}/restart",
            post(computeruse::restart_process),
        )
        .route(
            "/computeruse/process/{name}/logs",
            get(computeruse::process_logs),
        )
        .route(
            "/computeruse/process/{name}/errors",
            get(computeruse::process_errors),
        )
        .route("/computeruse/browser/open", post(computeruse::open_browser))
        .route("/computeruse/browser/close", post(computeruse::close_browser))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ))
        .with_state(state)
}

/// Serves the toolbox API until the listener fails.
pub async fn serve(
    port: u16,
    registry: Arc<ProcessRegistry>,
    desktop: Arc<DesktopSupervisor>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "toolbox server listening");
    axum::serve(listener, router(registry, desktop)).await?;
    Ok(())
}

/// Single shared bearer token; the sandbox network is the real boundary.
async fn require_token(
    State(state): State<ToolboxState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.token {
        let presented = request
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!(path = %request.uri().path(), "rejected request with missing or bad token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }
    next.run(request).await
}
