use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys the handler consumes itself; everything else in the body is forwarded.
pub const HANDLED_KEYS: [&str; 5] = ["messages", "system", "stream", "model", "max_tokens"];

pub const NO_JSON: &str = "No JSON data provided";
pub const NO_MESSAGES: &str = "No messages provided";
pub const INVALID_CONTENT: &str = "Invalid message content format";
pub const INVALID_SYSTEM: &str = "Invalid system prompt format";
pub const INVALID_STREAM: &str = "Invalid stream flag";
pub const INVALID_MAX_TOKENS: &str = "Invalid max_tokens value";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    PlainText(String),
    PartList(Vec<ContentPart>),
}

impl MessageContent {
    /// Flattens the content into a prompt; only text parts count, joined by single spaces.
    pub fn into_prompt(self) -> String {
        match self {
            MessageContent::PlainText(text) => text,
            MessageContent::PartList(parts) => parts
                .into_iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text),
                    ContentPart::Other => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Inbound `/v1/messages` body after boundary validation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub prompt: String,
    /// Either a plain string or a list of system content blocks, forwarded as sent.
    pub system: Option<Value>,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub passthrough: Map<String, Value>,
}

impl ChatRequest {
    pub fn parse(body: &[u8]) -> AppResult<Self> {
        let value: Value = serde_json::from_slice(body).map_err(|_| AppError::validation(NO_JSON))?;
        let Value::Object(mut obj) = value else {
            return Err(AppError::validation(NO_JSON));
        };
        if obj.is_empty() {
            return Err(AppError::validation(NO_JSON));
        }

        let first = match obj.get("messages") {
            Some(Value::Array(messages)) if !messages.is_empty() => messages[0].clone(),
            _ => return Err(AppError::validation(NO_MESSAGES)),
        };
        // Only the first message is forwarded; later turns are accepted and ignored.
        let content = first
            .get("content")
            .cloned()
            .and_then(|raw| serde_json::from_value::<MessageContent>(raw).ok())
            .ok_or_else(|| AppError::validation(INVALID_CONTENT))?;

        let model = obj
            .get("model")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let system = match obj.get("system") {
            None | Some(Value::Null) => None,
            Some(v @ (Value::String(_) | Value::Array(_))) => Some(v.clone()),
            Some(_) => return Err(AppError::validation(INVALID_SYSTEM)),
        };
        let stream = match obj.get("stream") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => return Err(AppError::validation(INVALID_STREAM)),
        };
        let max_tokens = match obj.get("max_tokens") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(token_limit(raw).ok_or_else(|| AppError::validation(INVALID_MAX_TOKENS))?),
        };

        for key in HANDLED_KEYS {
            obj.remove(key);
        }

        Ok(Self {
            model,
            prompt: content.into_prompt(),
            system,
            stream,
            max_tokens,
            passthrough: obj,
        })
    }
}

/// Positive integer token limit; integral floats such as `4096.0` are accepted.
fn token_limit(raw: &Value) -> Option<u64> {
    let limit = match raw.as_u64() {
        Some(n) => n,
        None => {
            let f = raw.as_f64()?;
            if f.fract() != 0.0 || f < 1.0 || f > u64::MAX as f64 {
                return None;
            }
            f as u64
        }
    };
    (limit > 0).then_some(limit)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

fn default_message_type() -> String {
    "message".to_string()
}

/// Token counts on streamed events. The gateway does no real accounting while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl StreamUsage {
    pub const START_PLACEHOLDER: StreamUsage = StreamUsage {
        input_tokens: 1,
        output_tokens: 1,
    };
    pub const FINAL_PLACEHOLDER: StreamUsage = StreamUsage {
        input_tokens: 100,
        output_tokens: 150,
    };
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMessageStart {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub role: &'static str,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: StreamUsage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextDelta {
    TextDelta { text: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeltaBody {
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: TextDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: StreamUsage,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn message_start(id: String, model: String) -> Self {
        StreamEvent::MessageStart {
            message: StreamMessageStart {
                id,
                message_type: "message",
                role: "assistant",
                content: Vec::new(),
                model,
                stop_reason: None,
                stop_sequence: None,
                usage: StreamUsage::START_PLACEHOLDER,
            },
        }
    }

    pub fn text_block_start(index: u32) -> Self {
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock {
                block_type: "text".to_string(),
                text: String::new(),
            },
        }
    }

    pub fn text_delta(index: u32, text: String) -> Self {
        StreamEvent::ContentBlockDelta {
            index,
            delta: TextDelta::TextDelta { text },
        }
    }

    pub fn end_turn(text: String) -> Self {
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: "end_turn".to_string(),
                stop_sequence: None,
                content: vec![ContentBlock {
                    block_type: "text".to_string(),
                    text,
                }],
            },
            usage: StreamUsage::FINAL_PLACEHOLDER,
        }
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: StreamError {
                error_type: "api_error".to_string(),
                message: message.into(),
            },
        }
    }
}
