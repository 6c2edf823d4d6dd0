use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request correlation data, created by [`log_request`] and handed to handlers explicitly.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            method: String::new(),
            path: String::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string())
}

fn loggable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = match name.as_str() {
                "authorization" | "x-api-key" | "proxy-authorization" => "<redacted>".to_string(),
                _ => value.to_str().unwrap_or("<binary>").to_string(),
            };
            (name.to_string(), shown)
        })
        .collect()
}

/// Logs every inbound request and attaches a [`RequestContext`] to it.
pub async fn log_request(mut req: Request, next: Next) -> Response {
    let ctx = RequestContext {
        request_id: request_id_from(req.headers()),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
    };
    let span = tracing::info_span!("request", request_id = %ctx.request_id);
    async move {
        tracing::info!(
            method = %ctx.method,
            uri = %req.uri(),
            headers = ?loggable_headers(req.headers()),
            "request received"
        );
        req.extensions_mut().insert(ctx);
        let response = next.run(req).await;
        tracing::info!(status = response.status().as_u16(), "request finished");
        response
    }
    .instrument(span)
    .await
}
