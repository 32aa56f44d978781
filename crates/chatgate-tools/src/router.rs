//! Tools Router - read-only HTTP endpoints for the tool catalogue
//!
//! Mount this at `/api/tools`:
//! ```ignore
//! let state = ToolsState::new(registry);
//! let app = Router::new().nest("/api/tools", create_router(state));
//! ```

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Tools service state
#[derive(Clone)]
pub struct ToolsState {
    pub registry: Arc<ToolRegistry>,
}

impl ToolsState {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

/// Create the tools router
pub fn create_router(state: ToolsState) -> Router {
    Router::new()
        .route("/", get(list_tools_handler))
        .route("/stats", get(stats_handler))
        .route("/:name", get(get_tool_handler))
        .with_state(state)
}

async fn list_tools_handler(State(state): State<ToolsState>) -> impl IntoResponse {
    let tools = state.registry.list().await;
    let tool_list: Vec<_> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description
            })
        })
        .collect();

    Json(json!({
        "tools": tool_list,
        "count": tool_list.len()
    }))
}

async fn stats_handler(State(state): State<ToolsState>) -> impl IntoResponse {
    Json(state.registry.stats().await)
}

async fn get_tool_handler(
    State(state): State<ToolsState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.definition(&name).await {
        Some(tool) => (
            StatusCode::OK,
            Json(json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "kind": "not_found", "message": format!("Tool '{}' not found", name) })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn router() -> Router {
        let registry = Arc::new(ToolRegistry::new());
        crate::register_builtin_tools(&registry).await.unwrap();
        create_router(ToolsState::new(registry))
    }

    #[tokio::test]
    async fn test_list_tools() {
        let response = router()
            .await
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["count"], 4);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_404() {
        let response = router()
            .await
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
