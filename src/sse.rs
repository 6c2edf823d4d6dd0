//! Re-frames a stream of upstream text fragments as Anthropic Messages SSE events.
//!
//! Once the first event is written the HTTP status is fixed at 200. If the upstream fails
//! mid-stream, a single `error` event is written and the stream ends without
//! `content_block_stop` / `message_delta` / `message_stop`. Clients must accept a truncated stream.

use crate::adapter::TextStream;
use crate::context::RequestContext;
use crate::messages::StreamEvent;
use axum::response::sse::Event;
use futures_util::StreamExt;
use std::convert::Infallible;
use tokio::sync::mpsc;

const TEXT_BLOCK_INDEX: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReframeState {
    Start,
    BlockStart,
    Streaming,
    BlockStop,
    MessageDelta,
    MessageStop,
    Done,
}

pub fn to_sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// Spawns the re-framer and returns the downstream event stream. The upstream fragments are
/// dropped as soon as they are exhausted or fail, or when the client goes away.
pub fn reframe(
    ctx: RequestContext,
    model: String,
    fragments: TextStream,
) -> impl futures_util::Stream<Item = StreamEvent> + Send + 'static {
    let (tx, rx) = mpsc::channel::<StreamEvent>(1);
    tokio::spawn(async move {
        run(&ctx, model, fragments, tx).await;
    });
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

pub fn sse_stream(
    ctx: RequestContext,
    model: String,
    fragments: TextStream,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    reframe(ctx, model, fragments).map(|event| Ok(to_sse_event(&event)))
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

async fn run(
    ctx: &RequestContext,
    model: String,
    fragments: TextStream,
    tx: mpsc::Sender<StreamEvent>,
) {
    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let mut fragments = Some(fragments);
    let mut accumulated = String::new();
    let mut state = ReframeState::Start;

    while state != ReframeState::Done {
        state = match state {
            ReframeState::Start => {
                let start = StreamEvent::message_start(message_id.clone(), model.clone());
                if !emit(&tx, start).await {
                    break;
                }
                ReframeState::BlockStart
            }
            ReframeState::BlockStart => {
                if !emit(&tx, StreamEvent::text_block_start(TEXT_BLOCK_INDEX)).await {
                    break;
                }
                ReframeState::Streaming
            }
            ReframeState::Streaming => {
                let Some(upstream) = fragments.as_mut() else {
                    break;
                };
                let next = tokio::select! {
                    _ = tx.closed() => {
                        tracing::info!(request_id = %ctx.request_id, "client disconnected mid-stream");
                        break;
                    }
                    next = upstream.next() => next,
                };
                match next {
                    Some(Ok(text)) => {
                        accumulated.push_str(&text);
                        tracing::debug!(request_id = %ctx.request_id, chunk = %text, "streaming chunk");
                        if !emit(&tx, StreamEvent::text_delta(TEXT_BLOCK_INDEX, text)).await {
                            break;
                        }
                        ReframeState::Streaming
                    }
                    Some(Err(err)) => {
                        fragments = None;
                        tracing::error!(
                            request_id = %ctx.request_id,
                            error = %err,
                            "upstream stream failed"
                        );
                        let _ = emit(&tx, StreamEvent::api_error(err.to_string())).await;
                        ReframeState::Done
                    }
                    None => {
                        fragments = None;
                        ReframeState::BlockStop
                    }
                }
            }
            ReframeState::BlockStop => {
                let stop = StreamEvent::ContentBlockStop {
                    index: TEXT_BLOCK_INDEX,
                };
                if !emit(&tx, stop).await {
                    break;
                }
                ReframeState::MessageDelta
            }
            ReframeState::MessageDelta => {
                let delta = StreamEvent::end_turn(std::mem::take(&mut accumulated));
                if !emit(&tx, delta).await {
                    break;
                }
                ReframeState::MessageStop
            }
            ReframeState::MessageStop => {
                let _ = emit(&tx, StreamEvent::MessageStop).await;
                tracing::info!(request_id = %ctx.request_id, "stream completed");
                ReframeState::Done
            }
            ReframeState::Done => ReframeState::Done,
        };
    }
}
