use std::collections::HashMap;

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use serde::Serialize;

use deck_desktop::BrowserOpenRequest;
use deck_desktop::DesktopError;
use deck_desktop::ProcessStatus;
use deck_desktop::SystemStatus;

use crate::toolbox::ApiError;
use crate::toolbox::ToolboxState;

#[derive(Debug, Serialize)]
pub(crate) struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    status: SystemStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    logs: String,
}

fn map_desktop_error(err: DesktopError) -> ApiError {
    match err {
        DesktopError::ProcessNotFound { .. } => ApiError::not_found(err.to_string()),
        DesktopError::NoLogFile { .. } => ApiError::bad_request(err.to_string()),
        _ => ApiError::internal(err.to_string()),
    }
}

/// POST /computeruse/start: bring up the desktop stack. Errors when any
/// required process fails to come up.
pub async fn start(State(state): State<ToolboxState>) -> Result<Json<StatusResponse>, ApiError> {
    state.desktop.start().await.map_err(map_desktop_error)?;
    Ok(Json(StatusResponse {
        status: state.desktop.system_status(),
    }))
}

/// POST /computeruse/stop: SIGKILL every process group in reverse priority
/// order.
pub async fn stop(State(state): State<ToolboxState>) -> Json<StatusResponse> {
    state.desktop.stop();
    Json(StatusResponse {
        status: state.desktop.system_status(),
    })
}

/// GET /computeruse/status: aggregated health of the required set.
pub async fn status(State(state): State<ToolboxState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.desktop.system_status(),
    })
}

/// GET /computeruse/process-status: per-record snapshot.
pub async fn process_status(
    State(state): State<ToolboxState>,
) -> Json<HashMap<String, ProcessStatus>> {
    Json(state.desktop.process_status())
}

/// POST /computeruse/process/{name}/restart
pub async fn restart_process(
    State(state): State<ToolboxState>,
    Path(name): Path<String>,
) -> Result<Json<Empty>, ApiError> {
    state
        .desktop
        .restart_process(&name)
        .await
        .map_err(map_desktop_error)?;
    Ok(Json(Empty {}))
}

/// GET /computeruse/process/{name}/logs
pub async fn process_logs(
    State(state): State<ToolboxState>,
    Path(name): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    let logs = state
        .desktop
        .process_logs(&name)
        .map_err(map_desktop_error)?;
    Ok(Json(LogsResponse { logs }))
}

/// GET /computeruse/process/{name}/errors
pub async fn process_errors(
    State(state): State<ToolboxState>,
    Path(name): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    let logs = state
        .desktop
        .process_errors(&name)
        .map_err(map_desktop_error)?;
    Ok(Json(LogsResponse { logs }))
}

/// POST /computeruse/browser/open
pub async fn open_browser(
    State(state): State<ToolboxState>,
    Json(request): Json<BrowserOpenRequest>,
) -> Result<Json<Empty>, ApiError> {
    state
        .desktop
        .open_browser(request)
        .await
        .map_err(map_desktop_error)?;
    Ok(Json(Empty {}))
}

/// POST /computeruse/browser/close
pub async fn close_browser(State(state): State<ToolboxState>) -> Json<Empty> {
    state.desktop.close_browser();
    Json(Empty {})
}
