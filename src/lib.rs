//! relaybot: a conversational relay that keeps per-user history.
//!
//! A user message is combined with the stored conversation into a prompt,
//! sent to a language model, and the exchange is persisted to a durable SQL
//! backend with a local JSON file as fallback.

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod logging;
pub mod relay;
pub mod storage;

pub use error::{Error, Result};
