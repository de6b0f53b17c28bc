pub mod coordinator;
pub mod prompt;
pub mod registry;

pub use coordinator::{END_TOKEN, GenerationCoordinator, GenerationEvent, GenerationRequest};

/// Identifies a logical conversation.  At most one generation runs per id.
pub type ConversationId = i64;
