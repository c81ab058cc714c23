//! REST equivalents of the WebSocket requests.
//!
//! Same contracts as the gateway, answered synchronously. The caller is
//! taken from the `Authorization: Bearer` header.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parley_core::auth::bearer_token;
use parley_core::{Caller, ChatError, Identity};
use parley_protocol::{ErrorKind, Message, MessageId, UserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::gateway::AppState;
use crate::metrics;

/// Routes mounted under `/api/v1`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/messages", post(send_message).get(list_messages))
        .route("/messages/conversation/:user_id", get(conversation))
        .route("/messages/read/:sender_id", post(mark_read))
        .route("/messages/:message_id", delete(delete_message))
}

/// An error rendered as an HTTP response with a `{kind, code, message}` body.
#[derive(Debug, Serialize)]
pub struct ApiError {
    kind: ErrorKind,
    code: u16,
    message: String,
}

impl ApiError {
    /// A message id in the path that can never name a message.
    fn unknown_message(raw: &str) -> Self {
        metrics::record_error(ErrorKind::NotFoundError);
        Self {
            kind: ErrorKind::NotFoundError,
            code: ErrorKind::NotFoundError.code(),
            message: format!("Message not found: {}", raw),
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFoundError => StatusCode::NOT_FOUND,
            ErrorKind::PersistenceError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

/// JSON body extractor whose rejections are [`ChatError::Validation`].
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(failed(ChatError::validation(rejection.body_text()))),
        }
    }
}

/// Credential carried by an `Authorization: Bearer` header.
pub fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_owned)
}

/// The authenticated caller of a REST request.
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = header_token(&parts.headers)
            .ok_or_else(|| ChatError::Authentication("missing bearer token".into()))?;
        let identity = state.validator.validate(&token).await?;
        Ok(Self(identity))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub recipient_id: UserId,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub updated: u64,
}

fn failed(err: ChatError) -> ApiError {
    if matches!(err, ChatError::Persistence(_)) {
        warn!(error = %err, "REST request failed");
    }
    metrics::record_error(err.kind());
    ApiError::from(err)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    ValidJson(request): ValidJson<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let sent = state
        .service
        .send(Caller::request(&identity.user_id), &request.recipient_id, &request.text)
        .await
        .map_err(failed)?;
    metrics::record_message(sent.delivery.total());
    Ok((StatusCode::CREATED, Json(sent.message)))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .service
        .all_messages(Caller::request(&identity.user_id))
        .await
        .map_err(failed)?;
    Ok(Json(messages))
}

async fn conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .service
        .load_conversation(Caller::request(&identity.user_id), &UserId::new(user_id))
        .await
        .map_err(failed)?;
    Ok(Json(messages))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(sender_id): Path<String>,
) -> Result<Json<ReadResponse>, ApiError> {
    let updated = state
        .service
        .mark_read(Caller::request(&identity.user_id), &UserId::new(sender_id))
        .await
        .map_err(failed)?;
    Ok(Json(ReadResponse { updated }))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let message_id: MessageId = raw_id
        .parse()
        .map_err(|_| ApiError::unknown_message(&raw_id))?;
    state
        .service
        .delete(Caller::request(&identity.user_id), Some(message_id))
        .await
        .map_err(failed)?;
    Ok(StatusCode::NO_CONTENT)
}
