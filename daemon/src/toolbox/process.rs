use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use deck_core::execute::ExecuteError;
use deck_core::execute::ExecuteRequest;
use deck_core::execute::ExecuteResponse;
use deck_core::execute::execute;

use crate::toolbox::ApiError;
use crate::toolbox::ToolboxState;

/// POST /process/execute: run a shell command to completion and return its
/// exit code and combined output.
pub async fn execute_command(
    State(state): State<ToolboxState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    match execute(&state.registry, request).await {
        Ok(response) => Ok(Json(response)),
        Err(ExecuteError::EmptyCommand) => Err(ApiError::bad_request("empty command")),
        Err(ExecuteError::Timeout) => Err(ApiError::new(
            StatusCode::REQUEST_TIMEOUT,
            "command execution timeout",
        )),
        Err(err @ ExecuteError::Start { .. }) => Err(ApiError::internal(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use deck_core::reap::ProcessRegistry;
    use deck_desktop::DesktopSupervisor;

    fn state() -> ToolboxState {
        ToolboxState::for_tests(
            Arc::new(ProcessRegistry::default()),
            Arc::new(DesktopSupervisor::new()),
        )
    }

    #[tokio::test]
    async fn execute_returns_exit_code_and_output() {
        let response = execute_command(
            State(state()),
            Json(ExecuteRequest {
                command: "/bin/sh -c 'echo toolbox'".to_string(),
                cwd: None,
                timeout: None,
            }),
        )
        .await
        .expect("execute");
        assert_eq!(response.0.exit_code, 0);
        assert_eq!(response.0.result, "toolbox\n");
    }

    #[tokio::test]
    async fn empty_command_maps_to_bad_request() {
        let err = execute_command(
            State(state()),
            Json(ExecuteRequest {
                command: String::new(),
                cwd: None,
                timeout: None,
            }),
        )
        .await
        .err()
        .expect("error");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn timeout_maps_to_request_timeout() {
        let err = execute_command(
            State(state()),
            Json(ExecuteRequest {
                command: "sleep 5".to_string(),
                cwd: None,
                timeout: Some(1),
            }),
        )
        .await
        .err()
        .expect("error");
        assert_eq!(err.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
