//! Conversation endpoints: talk, read history, clear history.

use super::state::ApiState;
use crate::conversation::Message;
use crate::error::Error;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct TalkRequest {
    user_id: String,
    text: String,
}

#[derive(Debug, Serialize)]
pub(super) struct TalkResponse {
    reply: String,
    user_id: String,
    message_id: String,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(super) struct HistoryResponse {
    user_id: String,
    messages: Vec<Message>,
    count: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct ClearResponse {
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Error surfaced to HTTP clients as `{"error": ...}`.
#[derive(Debug)]
pub(super) struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::Validation(error) => Self {
                status: StatusCode::BAD_REQUEST,
                message: error.to_string(),
            },
            Error::Model(error) => Self {
                status: StatusCode::BAD_GATEWAY,
                message: error.user_message().to_string(),
            },
            other => {
                tracing::error!(error = %other, "request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal server error".into(),
                }
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("missing or invalid user_id/text: {}", rejection.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Run one conversational turn.
pub(super) async fn talk(
    State(state): State<Arc<ApiState>>,
    request: Result<Json<TalkRequest>, JsonRejection>,
) -> Result<Json<TalkResponse>, ApiError> {
    let Json(request) = request?;
    let reply = state
        .relay
        .handle_message(&request.user_id, &request.text)
        .await?;

    Ok(Json(TalkResponse {
        reply: reply.text,
        user_id: request.user_id,
        message_id: reply.message_id,
        timestamp: reply.timestamp,
    }))
}

pub(super) async fn get_history(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or_else(|| state.relay.history().retention());
    let messages = state.relay.get_history(&user_id, limit).await?;

    Ok(Json(HistoryResponse {
        count: messages.len(),
        user_id,
        messages,
    }))
}

pub(super) async fn clear_history(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    if !state.relay.clear_history(&user_id).await? {
        return Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to clear history for {user_id}"),
        });
    }

    Ok(Json(ClearResponse {
        message: format!("History cleared for {user_id}"),
    }))
}
