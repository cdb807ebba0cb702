use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::CallContext;
use crate::error::LLMError;
use crate::provider::ChunkStream;
use crate::types::{
    ChunkDelta, ContentPart, FinishReason, GenerateResponse, Message, Role, StreamChunk,
    ToolCall, ToolCallDelta, Usage,
};

/// Provider-side incremental event, before sequencing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Content appended to the reply.
    Delta(ChunkDelta),
    /// Token accounting; reports are added together over the stream.
    Usage(Usage),
    /// End of generation, optionally carrying a last piece of content.
    Finish {
        reason: FinishReason,
        delta: ChunkDelta,
    },
}

impl RawEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Delta(ChunkDelta::text(text))
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self::Finish {
            reason,
            delta: ChunkDelta::Empty,
        }
    }
}

/// Raw provider event feed consumed by [`multiplex`].
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, LLMError>> + Send>>;

type CancelFuture = Pin<Box<dyn Future<Output = LLMError> + Send>>;

/// Turns a raw provider event feed into a [`ChunkStream`].
///
/// The resulting stream numbers chunks from 0 without gaps and always ends with
/// exactly one final chunk:
///
/// - a [`RawEvent::Finish`] becomes the final chunk, with the usage accumulated so far;
/// - an upstream `Err` becomes a final chunk carrying that error;
/// - an upstream that ends without finishing becomes a final
///   [`ErrorKind::ProviderUnavailable`] chunk;
/// - when `ctx` fires, the upstream is dropped and a final chunk carrying the
///   context's error is produced.
///
/// Nothing is read ahead of the consumer.
///
/// [`ErrorKind::ProviderUnavailable`]: crate::error::ErrorKind::ProviderUnavailable
///
/// # Examples
///
/// ```
/// # use futures_util::{stream, StreamExt};
/// # use llm_switchboard::context::CallContext;
/// # use llm_switchboard::stream::{multiplex, RawEvent};
/// # use llm_switchboard::types::FinishReason;
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let events = stream::iter(vec![
///     Ok(RawEvent::text("He")),
///     Ok(RawEvent::text("llo")),
///     Ok(RawEvent::finish(FinishReason::Stop)),
/// ]);
/// let chunks: Vec<_> = multiplex(&CallContext::new(), Box::pin(events)).collect().await;
/// assert_eq!(chunks.len(), 3);
/// assert!(chunks[2].is_final);
/// # });
/// ```
pub fn multiplex(ctx: &CallContext, events: RawEventStream) -> ChunkStream {
    Box::pin(ChunkMultiplexer::new(ctx, events))
}

/// Re-applies the chunk contract to a stream produced elsewhere.
///
/// Chunks are renumbered from 0, anything after the first final chunk is discarded,
/// a missing final chunk is synthesized, and `ctx` cancellation is honored even when
/// the inner stream ignores it.
pub fn guard(ctx: &CallContext, chunks: ChunkStream) -> ChunkStream {
    let events = chunks.flat_map(|chunk| stream::iter(chunk_events(chunk)));
    multiplex(ctx, Box::pin(events))
}

fn chunk_events(chunk: StreamChunk) -> Vec<Result<RawEvent, LLMError>> {
    let mut events = Vec::with_capacity(2);
    if let Some(usage) = chunk.usage {
        if !usage.is_empty() {
            events.push(Ok(RawEvent::Usage(usage)));
        }
    }
    match (chunk.error, chunk.is_final) {
        (Some(err), _) => events.push(Err(err)),
        (None, true) => events.push(Ok(RawEvent::Finish {
            reason: chunk.finish_reason.unwrap_or(FinishReason::Stop),
            delta: chunk.delta,
        })),
        (None, false) => events.push(Ok(RawEvent::Delta(chunk.delta))),
    }
    events
}

struct ChunkMultiplexer {
    upstream: Option<RawEventStream>,
    cancelled: Option<CancelFuture>,
    next_index: u64,
    usage: Usage,
}

impl ChunkMultiplexer {
    fn new(ctx: &CallContext, upstream: RawEventStream) -> Self {
        let ctx = ctx.clone();
        Self {
            upstream: Some(upstream),
            cancelled: Some(Box::pin(async move { ctx.cancelled().await })),
            next_index: 0,
            usage: Usage::default(),
        }
    }

    fn next_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Releases the upstream before the final chunk is handed out.
    fn close(&mut self) {
        self.upstream = None;
        self.cancelled = None;
    }

    fn emit(&mut self, delta: ChunkDelta) -> StreamChunk {
        let index = self.next_index();
        StreamChunk::delta(index, delta)
    }

    fn finish(&mut self, reason: FinishReason, delta: ChunkDelta) -> StreamChunk {
        self.close();
        let index = self.next_index();
        StreamChunk::finished(index, delta, reason, self.usage)
    }

    fn fail(&mut self, err: LLMError) -> StreamChunk {
        self.close();
        let index = self.next_index();
        StreamChunk::failed(index, err, self.usage)
    }
}

impl Stream for ChunkMultiplexer {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.upstream.is_none() {
            return Poll::Ready(None);
        }

        if let Some(cancelled) = this.cancelled.as_mut() {
            if let Poll::Ready(err) = cancelled.as_mut().poll(cx) {
                return Poll::Ready(Some(this.fail(err)));
            }
        }

        loop {
            let polled = match this.upstream.as_mut() {
                Some(upstream) => upstream.as_mut().poll_next(cx),
                None => return Poll::Ready(None),
            };
            match polled {
                Poll::Ready(Some(Ok(RawEvent::Usage(usage)))) => {
                    this.usage.accumulate(&usage);
                }
                Poll::Ready(Some(Ok(RawEvent::Delta(delta)))) => {
                    return Poll::Ready(Some(this.emit(delta)));
                }
                Poll::Ready(Some(Ok(RawEvent::Finish { reason, delta }))) => {
                    return Poll::Ready(Some(this.finish(reason, delta)));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(this.fail(err))),
                Poll::Ready(None) => {
                    let err = LLMError::unavailable("stream closed before completion");
                    return Poll::Ready(Some(this.fail(err)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Producer half of [`raw_channel`].
#[derive(Debug, Clone)]
pub struct RawEventSender {
    tx: mpsc::Sender<Result<RawEvent, LLMError>>,
}

impl RawEventSender {
    /// Waits for buffer space, then enqueues the event.
    ///
    /// # Errors
    ///
    /// Returns a cancelled error once the consuming stream has been dropped, which is
    /// the producer's signal to stop and release its resources.
    pub async fn send(&self, event: RawEvent) -> Result<(), LLMError> {
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| LLMError::cancelled("stream consumer went away"))
    }

    /// Ends the stream with an error.
    pub async fn fail(&self, error: LLMError) -> Result<(), LLMError> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| LLMError::cancelled("stream consumer went away"))
    }

    /// Resolves once the consuming stream has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded bridge for push-style transports (callbacks, background readers).
///
/// The producer suspends once `capacity` events are waiting, so a slow consumer
/// throttles the producer instead of growing a buffer.
pub fn raw_channel(capacity: usize) -> (RawEventSender, RawEventStream) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let events = stream::poll_fn(move |cx| rx.poll_recv(cx));
    (RawEventSender { tx }, Box::pin(events))
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Folds a chunk sequence into the equivalent [`GenerateResponse`].
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
    error: Option<LLMError>,
    finished: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        if self.finished {
            return;
        }
        match &chunk.delta {
            ChunkDelta::Text { text } => self.text.push_str(text),
            ChunkDelta::ToolCall(delta) => self.push_tool_call(delta),
            ChunkDelta::Empty => {}
        }
        if chunk.is_final {
            self.finished = true;
            self.finish_reason = chunk.finish_reason;
            self.error = chunk.error.clone();
            if let Some(usage) = chunk.usage {
                self.usage = usage;
            }
        }
    }

    fn push_tool_call(&mut self, delta: &ToolCallDelta) {
        let entry = self.tool_calls.entry(delta.index).or_default();
        if delta.id.is_some() {
            entry.id = delta.id.clone();
        }
        if delta.name.is_some() {
            entry.name = delta.name.clone();
        }
        entry.arguments.push_str(&delta.arguments_fragment);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Produces the response, or the error the stream ended with.
    pub fn finish(self) -> Result<GenerateResponse, LLMError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !self.finished {
            return Err(LLMError::unavailable("stream ended without a final chunk"));
        }

        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentPart::text(self.text));
        }
        for (index, call) in self.tool_calls {
            let arguments = if call.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments))
            };
            content.push(ContentPart::ToolCall(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name.unwrap_or_default(),
                arguments,
            }));
        }

        let message = Message {
            role: Role::Assistant,
            content,
            name: None,
            tool_call_id: None,
        };
        let reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        Ok(GenerateResponse::new(message, reason).with_usage(self.usage))
    }
}

/// Drains a chunk stream into a single response.
pub async fn collect(mut chunks: ChunkStream) -> Result<GenerateResponse, LLMError> {
    let mut accumulator = StreamAccumulator::new();
    while let Some(chunk) = chunks.next().await {
        accumulator.push(&chunk);
        if accumulator.is_finished() {
            break;
        }
    }
    accumulator.finish()
}
