//! HTTP API for the relay.
//!
//! Exposes the conversational turn, history inspection and clearing, and a
//! status endpoint as JSON over HTTP.

mod conversation;
mod server;
mod state;
mod system;

pub use server::{router, start_http_server};
pub use state::ApiState;
