//! Shared state for API handlers.

use crate::relay::Relay;

use std::sync::Arc;
use std::time::Instant;

/// State handed to every handler.
pub struct ApiState {
    pub relay: Arc<Relay>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            started_at: Instant::now(),
        }
    }
}
