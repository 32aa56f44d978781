//! chatgate-chat: sessions and the chat orchestration state machine
//!
//! - `session`: the registry that owns every session transcript
//! - `orchestrator`: drives one exchange through model rounds and tool calls
//! - `types`: events and outcomes handed to the transport layer

pub mod orchestrator;
pub mod session;
pub mod types;

// Re-export main types
pub use orchestrator::ChatOrchestrator;
pub use session::{RoundGuard, Session, SessionInfo, SessionRegistry};
pub use types::*;
