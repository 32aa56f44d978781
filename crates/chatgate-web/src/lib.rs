//! chatgate-web: HTTP and WebSocket transport
//!
//! ```text
//! POST /chat                 - one user message (JSON or SSE response)
//! GET  /ws                   - WebSocket chat
//! GET  /api/health           - health check
//! GET  /api/tools[/:name]    - tool catalogue
//! *    /api/sessions[/:id]   - session inspection
//! ```

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, create_ws_router};
pub use state::AppState;
