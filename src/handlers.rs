use crate::adapter::{AdapterError, MessageRequest};
use crate::app::AppState;
use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::messages::ChatRequest;
use crate::sse;
use axum::Json;
use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use serde_json::{Value, json};

pub async fn health(Extension(ctx): Extension<RequestContext>) -> Json<Value> {
    tracing::info!(request_id = %ctx.request_id, "health check request received");
    Json(json!({ "status": "healthy" }))
}

pub async fn create_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    match forward_message(&state, &ctx, &body).await {
        Ok(resp) => resp,
        Err(err) => {
            if err.is_validation() {
                tracing::warn!(request_id = %ctx.request_id, error = %err.message, "rejected request");
            } else {
                tracing::error!(
                    request_id = %ctx.request_id,
                    endpoint = %ctx.endpoint(),
                    code = %err.code,
                    body = %String::from_utf8_lossy(&body),
                    error = %err.message,
                    "error processing request"
                );
            }
            err.into_response()
        }
    }
}

async fn forward_message(state: &AppState, ctx: &RequestContext, body: &[u8]) -> AppResult<Response> {
    let req = ChatRequest::parse(body)?;
    tracing::debug!(
        request_id = %ctx.request_id,
        model = ?req.model,
        stream = req.stream,
        passthrough = ?req.passthrough.keys().collect::<Vec<_>>(),
        "processing request data"
    );
    let upstream_model = state.aliases.resolve(req.model.as_deref());
    let stream = req.stream;
    let message = MessageRequest {
        prompt: req.prompt,
        max_tokens: req.max_tokens,
        system: req.system,
        model: Some(upstream_model.clone()),
        extra: req.passthrough,
    };

    if stream {
        tracing::info!(request_id = %ctx.request_id, "processing streaming request");
        let fragments = match state.adapter.stream(message).await {
            Ok(fragments) => fragments,
            Err(err) => return Err(upstream_failure(state, ctx, err).await),
        };
        let events = sse::sse_stream(ctx.clone(), upstream_model, fragments);
        return Ok(Sse::new(events).into_response());
    }

    tracing::info!(request_id = %ctx.request_id, "processing non-streaming request");
    let response = match state.adapter.send(message).await {
        Ok(response) => response,
        Err(err) => return Err(upstream_failure(state, ctx, err).await),
    };
    tracing::debug!(request_id = %ctx.request_id, id = %response.id, "sending response");
    Ok(Json(response).into_response())
}

/// Converts an adapter failure into a 500. A 401 from the provider means the token expired, so
/// the session is refreshed before answering; the failed call itself is not retried.
async fn upstream_failure(state: &AppState, ctx: &RequestContext, err: AdapterError) -> AppError {
    if err.is_unauthorized() {
        tracing::warn!(request_id = %ctx.request_id, "upstream rejected credentials, refreshing token");
        if let Err(refresh_err) = state.adapter.refresh_token().await {
            tracing::error!(request_id = %ctx.request_id, error = %refresh_err, "token refresh failed");
        }
    }
    AppError::from(err)
}
