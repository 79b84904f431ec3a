//! Authorized completion endpoint.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::authorize;
use crate::completions::{AuthorizedRequest, ChatRequest};
use crate::error::ApiError;
use crate::state::AppState;

/// POST /v1/chat/completions - Authorized completion proxy
///
/// The scheme headers select exactly one authentication path; on success
/// the request is forwarded to the completion backend under the canonical
/// principal, buffered or streamed per the request's `stream` flag.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "Completions",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Backend payload (buffered) or event stream"),
        (status = 401, description = "Authentication failed"),
        (status = 429, description = "Budget or rate limit exceeded; integer error code with Retry-After"),
        (status = 502, description = "Completion backend unreachable")
    )
)]
pub async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut chat): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    chat.apply_defaults(&state.config);

    let principal = authorize(&state, &headers, &chat).await?;
    let authorized = AuthorizedRequest {
        user: principal.canonical(),
        request: chat,
    };

    if authorized.request.stream {
        state.upstream.stream(&authorized).await
    } else {
        let data = state.upstream.complete(&authorized).await?;
        Ok(Json(data).into_response())
    }
}
