//! Conversation history and prompt context management.

pub mod context;
pub mod history;
pub mod types;

pub use context::{PromptMessage, PromptRole, assemble_prompt};
pub use history::{HistoryManager, HistorySession};
pub use types::{ConversationLog, Message, Role};
