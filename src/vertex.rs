use crate::adapter::{
    AdapterError, AdapterSettings, MessagesSession, SessionOpener, TextStream, UpstreamRequest,
};
use crate::credentials::{ServiceAccountKey, fetch_access_token};
use crate::messages::MessageResponse;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;

pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

/// Opens Vertex AI sessions from a service-account credential file.
pub struct VertexOpener {
    http: reqwest::Client,
    settings: AdapterSettings,
    base_url: Option<String>,
}

impl VertexOpener {
    pub fn new(http: reqwest::Client, settings: AdapterSettings) -> Self {
        Self {
            http,
            settings,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait::async_trait]
impl SessionOpener for VertexOpener {
    async fn open(&self) -> Result<Arc<dyn MessagesSession>, AdapterError> {
        let key = ServiceAccountKey::from_file(&self.settings.service_account_file)?;
        let token = fetch_access_token(&self.http, &key).await?;
        tracing::info!(
            client_email = %key.client_email,
            expires_at = token.expires_at,
            "obtained upstream access token"
        );
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(&self.settings.location));
        Ok(Arc::new(VertexSession::new(
            self.http.clone(),
            base_url,
            &self.settings.project_id,
            &self.settings.location,
            token.token,
        )))
    }
}

pub fn default_base_url(location: &str) -> String {
    if location == "global" {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{location}-aiplatform.googleapis.com")
    }
}

pub struct VertexSession {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    location: String,
    access_token: String,
}

impl VertexSession {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        location: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            project_id: project_id.into(),
            location: location.into(),
            access_token: access_token.into(),
        }
    }

    pub fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamRawPredict"
        } else {
            "rawPredict"
        };
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/anthropic/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            self.project_id,
            self.location,
            model,
            method
        )
    }

    async fn post(
        &self,
        req: &UpstreamRequest,
        stream: bool,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut body = req.body(stream);
        body.insert(
            "anthropic_version".to_string(),
            Value::String(VERTEX_ANTHROPIC_VERSION.to_string()),
        );
        let url = self.endpoint(&req.model, stream);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| AdapterError::upstream(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::upstream_status(
                status.as_u16(),
                format!("upstream status {}: {}", status, text),
            ));
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl MessagesSession for VertexSession {
    async fn create(&self, req: &UpstreamRequest) -> Result<MessageResponse, AdapterError> {
        let resp = self.post(req, false).await?;
        let text = resp
            .text()
            .await
            .map_err(|err| AdapterError::upstream(err.to_string()))?;
        serde_json::from_str(&text)
            .map_err(|err| AdapterError::upstream(format!("invalid upstream response: {err}")))
    }

    async fn stream(&self, req: &UpstreamRequest) -> Result<TextStream, AdapterError> {
        let resp = self.post(req, true).await?;
        Ok(text_fragments(resp.bytes_stream()))
    }
}

enum Fragment {
    Text(String),
    Skip,
    Stop,
    Failed(AdapterError),
}

fn classify_event(event: &str, data: &str) -> Fragment {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Fragment::Skip,
    };
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or(event);
    match kind {
        "content_block_delta" => {
            let delta = value.get("delta");
            let is_text = delta
                .and_then(|d| d.get("type"))
                .and_then(|t| t.as_str())
                == Some("text_delta");
            match delta.and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                Some(text) if is_text => Fragment::Text(text.to_string()),
                _ => Fragment::Skip,
            }
        }
        "message_stop" => Fragment::Stop,
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("upstream stream error");
            Fragment::Failed(AdapterError::upstream(message.to_string()))
        }
        _ => Fragment::Skip,
    }
}

/// Turns an upstream Messages SSE byte stream into text fragments. The returned stream owns the
/// byte stream, so dropping it closes the provider connection.
pub fn text_fragments<S, B, E>(bytes: S) -> TextStream
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = Box::pin(bytes.eventsource());
    let stream = futures_util::stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            match events.next().await {
                None => return None,
                Some(Err(err)) => {
                    return Some((Err(AdapterError::upstream(err.to_string())), None));
                }
                Some(Ok(ev)) => match classify_event(&ev.event, &ev.data) {
                    Fragment::Text(text) => return Some((Ok(text), Some(events))),
                    Fragment::Skip => continue,
                    Fragment::Stop => return None,
                    Fragment::Failed(err) => return Some((Err(err), None)),
                },
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn sse(events: &[(&str, &str)]) -> Vec<Result<bytes::Bytes, std::io::Error>> {
        events
            .iter()
            .map(|(name, data)| Ok(bytes::Bytes::from(format!("event: {name}\ndata: {data}\n\n"))))
            .collect()
    }

    #[test]
    fn endpoint_uses_raw_predict_paths() {
        let session = VertexSession::new(
            reqwest::Client::new(),
            "https://us-east5-aiplatform.googleapis.com/",
            "meta-agents",
            "us-east5",
            "tok",
        );
        assert_eq!(
            session.endpoint("claude-3-5-haiku@20241022", false),
            "https://us-east5-aiplatform.googleapis.com/v1/projects/meta-agents/locations/us-east5/publishers/anthropic/models/claude-3-5-haiku@20241022:rawPredict"
        );
        assert!(session.endpoint("m", true).ends_with("/models/m:streamRawPredict"));
    }

    #[test]
    fn base_url_follows_region() {
        assert_eq!(
            default_base_url("us-east5"),
            "https://us-east5-aiplatform.googleapis.com"
        );
        assert_eq!(default_base_url("global"), "https://aiplatform.googleapis.com");
    }

    #[tokio::test]
    async fn text_deltas_are_extracted_in_order() {
        let chunks = sse(&[
            ("message_start", r#"{"type":"message_start","message":{"id":"m"}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            ("ping", r#"{"type":"ping"}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            ("message_stop", r#"{"type":"message_stop"}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"late"}}"#),
        ]);
        let fragments: Vec<String> = text_fragments(futures_util::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn upstream_error_event_ends_the_stream_with_an_error() {
        let chunks = sse(&[
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"a"}}"#),
            ("error", r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"b"}}"#),
        ]);
        let items: Vec<Result<String, AdapterError>> =
            text_fragments(futures_util::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(matches!(&items[1], Err(AdapterError::Upstream { message, .. }) if message == "Overloaded"));
    }
}
