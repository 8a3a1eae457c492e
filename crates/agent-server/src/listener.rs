//! Sub-agent Tool Listener
//!
//! Local HTTP endpoint through which spawned tool-servers (or agents they
//! start) route tool calls back into this agent's dispatcher. It shares the
//! conversation's admission flag, so overlapping work is refused with 409.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use agent_core::{ObserverEvent, ToolExecutionRecord};
use agent_mcp::McpError;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ToolCallResponse {
    Result { result: String },
    Error { error: String },
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub busy: bool,
    pub servers: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/tools/call", post(call_tool))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "Tool listener running");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        busy: state.busy.is_busy(),
        servers: state.dispatcher.registry().server_names().await,
    })
}

async fn call_tool(State(state): State<AppState>, Json(request): Json<ToolCallRequest>) -> Response {
    let Ok(_guard) = state.busy.try_acquire() else {
        tracing::warn!(tool = %request.tool_name, "Routed tool call refused: already processing");
        return (
            StatusCode::CONFLICT,
            Json(ToolCallResponse::Error {
                error: "already processing".into(),
            }),
        )
            .into_response();
    };

    let args = if request.args.is_null() {
        serde_json::json!({})
    } else {
        request.args
    };
    tracing::info!(tool = %request.tool_name, "Routed tool call");
    state.observer.notify(&ObserverEvent::ToolStart {
        name: request.tool_name.clone(),
        external: true,
    });

    match state.dispatcher.execute(&request.tool_name, args.clone()).await {
        Ok(result) => {
            state.observer.notify(&ObserverEvent::ToolComplete {
                name: request.tool_name.clone(),
                display_text: result.display_text.clone(),
                is_error: result.is_error,
                external: true,
            });
            let record = ToolExecutionRecord::new(
                uuid::Uuid::new_v4().to_string(),
                &request.tool_name,
                args,
                result.clone(),
            )
            .external();
            state.chat_log.tool_execution_added(&record);

            let body = if result.is_error {
                ToolCallResponse::Error {
                    error: result.display_text,
                }
            } else {
                ToolCallResponse::Result {
                    result: result.display_text,
                }
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            let message = e.to_string();
            state.observer.notify(&ObserverEvent::ToolComplete {
                name: request.tool_name,
                display_text: message.clone(),
                is_error: true,
                external: true,
            });
            let status = match e {
                McpError::ToolNotFound(_) | McpError::ServerNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(ToolCallResponse::Error { error: message })).into_response()
        }
    }
}
