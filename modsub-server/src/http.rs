//! HTTP surface over the command operations.
//!
//! Three routes, mirroring the three commands:
//!
//! - `POST /subscriptions` with `{"userID": "...", "modID": "..."}`
//! - `DELETE /subscriptions` with the same body
//! - `GET /users/{user_id}/subscriptions`
//!
//! Identifier validation failures are the caller's fault (400);
//! everything else surfaces as 500 without leaking internals beyond the
//! error message already safe to log.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use modsub::command::{CommandError, SubscriptionCommands};
use modsub::store::SubscriptionRow;
use modsub::types::{ModId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    commands: Arc<SubscriptionCommands>,
}

impl AppState {
    /// Wraps the command surface for the router.
    pub fn new(commands: Arc<SubscriptionCommands>) -> Self {
        Self { commands }
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/subscriptions", post(add_subscription).delete(remove_subscription))
        .route("/users/{user_id}/subscriptions", get(subscriptions_by_user))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    #[serde(rename = "userID")]
    user_id: String,
    #[serde(rename = "modID")]
    mod_id: String,
}

#[derive(Debug, Serialize)]
struct SubscriptionItem {
    #[serde(rename = "userID")]
    user_id: String,
    #[serde(rename = "modID")]
    mod_id: String,
}

#[derive(Debug, Serialize)]
struct SubscriptionsResponse {
    subscriptions: Vec<SubscriptionItem>,
}

impl From<SubscriptionRow> for SubscriptionItem {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            user_id: row.user_id.into_inner(),
            mod_id: row.mod_id.into_inner(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    InvalidRequest(String),
    Internal(CommandError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            Self::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        Self::Internal(err)
    }
}

fn parse_ids(request: &SubscriptionRequest) -> Result<(UserId, ModId), ApiError> {
    let user_id = UserId::try_new(&request.user_id)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid userID: {err}")))?;
    let mod_id = ModId::try_new(&request.mod_id)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid modID: {err}")))?;
    Ok((user_id, mod_id))
}

async fn add_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<StatusCode, ApiError> {
    let (user_id, mod_id) = parse_ids(&request)?;
    state.commands.add_subscription(user_id, mod_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn remove_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<StatusCode, ApiError> {
    let (user_id, mod_id) = parse_ids(&request)?;
    state.commands.remove_subscription(user_id, mod_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn subscriptions_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SubscriptionsResponse>, ApiError> {
    let user_id = UserId::try_new(&user_id)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid user id: {err}")))?;
    let rows = state.commands.subscriptions_by_user(&user_id).await?;
    Ok(Json(SubscriptionsResponse {
        subscriptions: rows.into_iter().map(SubscriptionItem::from).collect(),
    }))
}
