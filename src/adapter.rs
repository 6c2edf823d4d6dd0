use crate::messages::MessageResponse;
use futures_util::Stream;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Keys the adapter always sets itself; passthrough values for them are dropped.
pub const RESERVED_KEYS: [&str; 4] = ["messages", "system", "model", "stream"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },
}

impl AdapterError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }

    pub fn upstream_status(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Upstream { status: Some(401), .. })
    }
}

/// Lazy, single-pass sequence of text fragments. Dropping it releases the upstream connection.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, AdapterError>> + Send>>;

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub project_id: String,
    pub location: String,
    pub model: String,
    pub service_account_file: PathBuf,
}

/// One call's worth of input, as handed to the adapter by the request handler.
#[derive(Debug, Clone, Default)]
pub struct MessageRequest {
    pub prompt: String,
    pub max_tokens: Option<u64>,
    pub system: Option<Value>,
    pub model: Option<String>,
    pub extra: Map<String, Value>,
}

/// Fully assembled upstream call: what a session actually sends to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub system: Option<Value>,
    pub tools: Vec<Value>,
    pub max_tokens: u64,
    pub extra: Map<String, Value>,
}

impl UpstreamRequest {
    /// Anthropic Messages body without `model`; transports decide where the model goes.
    pub fn body(&self, stream: bool) -> Map<String, Value> {
        let mut body = Map::new();
        for (k, v) in &self.extra {
            body.insert(k.clone(), v.clone());
        }
        body.insert("max_tokens".to_string(), json!(self.max_tokens));
        body.insert("messages".to_string(), Value::Array(self.messages.clone()));
        if let Some(system) = &self.system {
            body.insert("system".to_string(), system.clone());
        }
        if !self.tools.is_empty() {
            body.insert("tools".to_string(), Value::Array(self.tools.clone()));
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        } else {
            body.remove("stream");
        }
        body
    }
}

/// A credentialed connection to the provider.
#[async_trait::async_trait]
pub trait MessagesSession: Send + Sync {
    async fn create(&self, req: &UpstreamRequest) -> Result<MessageResponse, AdapterError>;
    async fn stream(&self, req: &UpstreamRequest) -> Result<TextStream, AdapterError>;
}

/// Runs the credential flow and opens a fresh session.
#[async_trait::async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn MessagesSession>, AdapterError>;
}

pub struct ClaudeAdapter {
    settings: AdapterSettings,
    opener: Arc<dyn SessionOpener>,
    session: RwLock<Arc<dyn MessagesSession>>,
    tools: RwLock<Vec<Value>>,
}

impl ClaudeAdapter {
    pub async fn connect(
        settings: AdapterSettings,
        opener: Arc<dyn SessionOpener>,
    ) -> Result<Self, AdapterError> {
        tracing::info!(
            project_id = %settings.project_id,
            location = %settings.location,
            model = %settings.model,
            "initializing upstream client"
        );
        let session = opener.open().await?;
        Ok(Self {
            settings,
            opener,
            session: RwLock::new(session),
            tools: RwLock::new(Vec::new()),
        })
    }

    pub async fn refresh_token(&self) -> Result<(), AdapterError> {
        tracing::info!("refreshing upstream token");
        let session = self.opener.open().await?;
        *self.session.write().await = session;
        Ok(())
    }

    pub async fn add_tools(&self, tools: Vec<Value>) {
        tracing::info!(count = tools.len(), "replacing tool definitions");
        *self.tools.write().await = tools;
    }

    pub async fn send(&self, req: MessageRequest) -> Result<MessageResponse, AdapterError> {
        let upstream = self.build_request(req).await;
        tracing::info!(model = %upstream.model, "sending non-streaming request");
        let session = self.current_session().await;
        session.create(&upstream).await
    }

    pub async fn stream(&self, req: MessageRequest) -> Result<TextStream, AdapterError> {
        let upstream = self.build_request(req).await;
        tracing::info!(model = %upstream.model, "opening streaming request");
        let session = self.current_session().await;
        session.stream(&upstream).await
    }

    async fn current_session(&self) -> Arc<dyn MessagesSession> {
        self.session.read().await.clone()
    }

    async fn build_request(&self, req: MessageRequest) -> UpstreamRequest {
        let MessageRequest {
            prompt,
            max_tokens,
            system,
            model,
            mut extra,
        } = req;
        for key in RESERVED_KEYS {
            extra.remove(key);
        }
        let preview: String = prompt.chars().take(100).collect();
        tracing::debug!(prompt = %preview, "building upstream request");

        let mut tools = self.tools.read().await.clone();
        if tools.is_empty() {
            if let Some(Value::Array(requested)) = extra.remove("tools") {
                tools = requested;
            }
        } else {
            extra.remove("tools");
        }

        UpstreamRequest {
            model: model.unwrap_or_else(|| self.settings.model.clone()),
            messages: vec![json!({ "role": "user", "content": prompt })],
            system: system.filter(|s| !is_blank_system(s)),
            tools,
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            extra,
        }
    }
}

fn is_blank_system(system: &Value) -> bool {
    match system {
        Value::String(text) => text.is_empty(),
        Value::Array(blocks) => blocks.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Usage;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSession {
        label: &'static str,
        seen: Arc<Mutex<Vec<UpstreamRequest>>>,
    }

    #[async_trait::async_trait]
    impl MessagesSession for RecordingSession {
        async fn create(&self, req: &UpstreamRequest) -> Result<MessageResponse, AdapterError> {
            self.seen.lock().unwrap().push(req.clone());
            Ok(MessageResponse {
                id: "msg_1".to_string(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.label.to_string(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            })
        }

        async fn stream(&self, req: &UpstreamRequest) -> Result<TextStream, AdapterError> {
            self.seen.lock().unwrap().push(req.clone());
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    struct CountingOpener {
        opened: AtomicUsize,
        seen: Arc<Mutex<Vec<UpstreamRequest>>>,
    }

    #[async_trait::async_trait]
    impl SessionOpener for CountingOpener {
        async fn open(&self) -> Result<Arc<dyn MessagesSession>, AdapterError> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            let label = if n == 0 { "first" } else { "second" };
            Ok(Arc::new(RecordingSession {
                label,
                seen: self.seen.clone(),
            }))
        }
    }

    struct FailingOpener;

    #[async_trait::async_trait]
    impl SessionOpener for FailingOpener {
        async fn open(&self) -> Result<Arc<dyn MessagesSession>, AdapterError> {
            Err(AdapterError::Authentication("no key".to_string()))
        }
    }

    fn settings() -> AdapterSettings {
        AdapterSettings {
            project_id: "p".to_string(),
            location: "us-east5".to_string(),
            model: "default@1".to_string(),
            service_account_file: PathBuf::from("sa.json"),
        }
    }

    async fn adapter() -> (ClaudeAdapter, Arc<Mutex<Vec<UpstreamRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let opener = Arc::new(CountingOpener {
            opened: AtomicUsize::new(0),
            seen: seen.clone(),
        });
        (ClaudeAdapter::connect(settings(), opener).await.unwrap(), seen)
    }

    #[tokio::test]
    async fn connect_propagates_authentication_failure() {
        let result = ClaudeAdapter::connect(settings(), Arc::new(FailingOpener)).await;
        assert!(matches!(result, Err(AdapterError::Authentication(_))));
    }

    #[tokio::test]
    async fn send_builds_single_turn_request_and_strips_reserved_keys() {
        let (adapter, seen) = adapter().await;
        let mut extra = Map::new();
        extra.insert("temperature".to_string(), json!(0.2));
        extra.insert("messages".to_string(), json!([{"role": "user", "content": "x"}]));
        extra.insert("model".to_string(), json!("ignored"));
        extra.insert("stream".to_string(), json!(true));
        extra.insert("system".to_string(), json!("ignored"));
        adapter
            .send(MessageRequest {
                prompt: "hi".to_string(),
                max_tokens: None,
                system: Some(json!("be brief")),
                model: None,
                extra,
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let req = &seen[0];
        assert_eq!(req.model, "default@1");
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(req.messages, vec![json!({"role": "user", "content": "hi"})]);
        assert_eq!(req.system, Some(json!("be brief")));
        assert_eq!(req.extra.len(), 1);
        assert_eq!(req.extra["temperature"], json!(0.2));
    }

    #[tokio::test]
    async fn configured_tools_replace_request_tools() {
        let (adapter, seen) = adapter().await;
        let mut extra = Map::new();
        extra.insert("tools".to_string(), json!([{"name": "from_request"}]));

        adapter
            .send(MessageRequest {
                prompt: "a".to_string(),
                extra: extra.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        adapter.add_tools(vec![json!({"name": "configured"})]).await;
        adapter
            .stream(MessageRequest {
                prompt: "b".to_string(),
                extra,
                ..Default::default()
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].tools, vec![json!({"name": "from_request"})]);
        assert_eq!(seen[1].tools, vec![json!({"name": "configured"})]);
        assert!(!seen[1].extra.contains_key("tools"));
    }

    #[tokio::test]
    async fn refresh_swaps_session_in_place() {
        let (adapter, _) = adapter().await;
        let before = adapter.send(MessageRequest::default()).await.unwrap();
        assert_eq!(before.model, "first");
        adapter.refresh_token().await.unwrap();
        let after = adapter.send(MessageRequest::default()).await.unwrap();
        assert_eq!(after.model, "second");
    }

    #[test]
    fn body_sets_stream_flag_and_optional_fields() {
        let req = UpstreamRequest {
            model: "m".to_string(),
            messages: vec![json!({"role": "user", "content": "x"})],
            system: None,
            tools: Vec::new(),
            max_tokens: 8,
            extra: Map::new(),
        };
        let body = req.body(true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["max_tokens"], json!(8));
        assert!(!body.contains_key("system"));
        assert!(!body.contains_key("tools"));
        assert!(!body.contains_key("model"));
        assert!(!req.body(false).contains_key("stream"));
    }

    #[tokio::test]
    async fn system_blocks_reach_the_body_unchanged() {
        let (adapter, seen) = adapter().await;
        let blocks = json!([{"type": "text", "text": "You are terse."}]);
        adapter
            .send(MessageRequest {
                prompt: "hi".to_string(),
                system: Some(blocks.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        adapter
            .send(MessageRequest {
                prompt: "hi".to_string(),
                system: Some(json!([])),
                ..Default::default()
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].body(false)["system"], blocks);
        assert!(seen[1].system.is_none());
    }
}
