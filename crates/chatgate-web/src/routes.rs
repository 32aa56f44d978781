//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use chatgate_tools::ToolsState;

use crate::handlers;
use crate::state::AppState;

/// Create the complete router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let tools_routes = chatgate_tools::create_router(ToolsState::new(Arc::clone(&state.tool_registry)));

    // Inspection API
    let api_routes = Router::new()
        .route("/health", get(handlers::health::health_handler))
        .route(
            "/sessions",
            get(handlers::sessions::list_sessions_handler).post(handlers::sessions::create_session_handler),
        )
        .route(
            "/sessions/:id",
            get(handlers::sessions::get_session_handler).delete(handlers::sessions::delete_session_handler),
        )
        .with_state(Arc::clone(&state))
        .nest("/tools", tools_routes);

    Router::new()
        .route("/chat", post(handlers::chat::chat_handler))
        .route("/ws", get(handlers::websocket::websocket_handler))
        .with_state(state)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Router for a dedicated WebSocket listener
pub fn create_ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(handlers::websocket::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
