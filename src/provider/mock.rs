//! Scripted in-memory provider used to exercise the client and middleware.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::time::sleep;

use crate::config::ProviderConfig;
use crate::context::CallContext;
use crate::error::LLMError;
use crate::provider::{ChunkStream, LLMProvider};
use crate::stream::{RawEvent, RawEventStream, collect, multiplex};
use crate::types::{
    CapabilityDescriptor, ChunkDelta, GenerateRequest, GenerateResponse, ToolCallDelta,
};

/// Outcome of one scripted call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed with this response; streamed calls replay it as chunks.
    Respond(GenerateResponse),
    /// Fail the call. For streams this is a setup failure.
    Fail(LLMError),
    /// Stream these events; non-streamed calls collect them into a response.
    Stream(Vec<MockEvent>),
    /// Never answer; only the call context can end the call.
    Hang,
}

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum MockEvent {
    Event(RawEvent),
    /// Transport failure at this point of the stream.
    Fail(LLMError),
    /// Stop producing without closing the stream.
    Stall,
}

impl MockEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Event(RawEvent::text(text))
    }
}

/// In-memory [`LLMProvider`] that replays scripted replies in order.
///
/// When the script runs out, the `always` reply (if any) is repeated. The provider
/// records every request it receives and tracks how many of its streams are still
/// alive, which makes resource release observable in tests.
///
/// # Examples
///
/// ```
/// # use llm_switchboard::context::CallContext;
/// # use llm_switchboard::provider::LLMProvider;
/// # use llm_switchboard::provider::mock::{MockProvider, MockReply};
/// # use llm_switchboard::types::{FinishReason, GenerateRequest, GenerateResponse, Message};
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let provider = MockProvider::new("fake").always(MockReply::Respond(
///     GenerateResponse::new(Message::assistant("hello"), FinishReason::Stop),
/// ));
/// let request = GenerateRequest::new("m1", vec![Message::user("hi")]);
/// let response = provider.generate(&CallContext::new(), &request).await.unwrap();
/// assert_eq!(response.text(), "hello");
/// assert_eq!(provider.calls(), 1);
/// # });
/// ```
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerateRequest>>,
    open_streams: Arc<AtomicUsize>,
    latency: Option<Duration>,
    event_delay: Option<Duration>,
    capabilities: CapabilityDescriptor,
    default_model: Option<String>,
    request_timeout: Option<Duration>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            open_streams: Arc::new(AtomicUsize::new(0)),
            latency: None,
            event_delay: None,
            capabilities: CapabilityDescriptor::default(),
            default_model: None,
            request_timeout: None,
        }
    }

    /// Applies the shared provider options: `defaultModel` fills in responses that
    /// name no model, `requestTimeout` bounds each call.
    pub fn from_config(name: impl Into<String>, config: &ProviderConfig) -> Self {
        let mut provider = Self::new(name);
        provider.default_model = config.default_model.clone();
        provider.request_timeout = config.request_timeout;
        provider
    }

    /// Appends a reply to the script.
    pub fn then(self, reply: MockReply) -> Self {
        self.lock_script().push_back(reply);
        self
    }

    /// Reply used once the script is exhausted.
    pub fn always(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Delay before a non-streamed reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay before each streamed event.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityDescriptor) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Number of `generate` and `stream` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Streams created by this provider that have not been dropped yet.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<MockReply>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, request: &GenerateRequest) -> Result<MockReply, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.lock_script()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| {
                LLMError::internal("mock provider has no scripted reply left")
                    .with_provider(self.name.clone())
            })
    }

    fn scoped(&self, ctx: &CallContext) -> CallContext {
        match self.request_timeout {
            Some(timeout) => ctx.with_call_timeout(timeout),
            None => ctx.clone(),
        }
    }

    fn tag(&self, err: LLMError) -> LLMError {
        if err.provider().is_some() {
            err
        } else {
            err.with_provider(self.name.clone())
        }
    }

    fn finalize(&self, mut response: GenerateResponse) -> GenerateResponse {
        if response.model.is_none() {
            response.model = self.default_model.clone();
        }
        if response.provider.provider.is_empty() {
            response.provider.provider = self.name.clone();
        }
        response
    }

    fn script_stream(&self, events: Vec<MockEvent>) -> RawEventStream {
        let open = OpenStream::new(self.open_streams.clone());
        let delay = self.event_delay;
        let body = stream::unfold(
            (VecDeque::from(events), open),
            move |(mut queue, open)| async move {
                let event = queue.pop_front()?;
                if let Some(delay) = delay {
                    sleep(delay).await;
                }
                let item = match event {
                    MockEvent::Event(event) => Ok(event),
                    MockEvent::Fail(err) => Err(err),
                    MockEvent::Stall => return pending().await,
                };
                Some((item, (queue, open)))
            },
        );
        Box::pin(body)
    }
}

/// Replays a complete response as stream events.
fn response_events(response: &GenerateResponse) -> Vec<MockEvent> {
    let mut events = Vec::new();
    let text = response.text();
    if !text.is_empty() {
        events.push(MockEvent::text(text));
    }
    for (index, call) in response.tool_calls.iter().enumerate() {
        events.push(MockEvent::Event(RawEvent::Delta(ChunkDelta::ToolCall(
            ToolCallDelta {
                index,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_fragment: call.arguments.to_string(),
            },
        ))));
    }
    if !response.usage.is_empty() {
        events.push(MockEvent::Event(RawEvent::Usage(response.usage)));
    }
    events.push(MockEvent::Event(RawEvent::finish(response.finish_reason)));
    events
}

/// Counts a live scripted stream until dropped.
struct OpenStream(Arc<AtomicUsize>);

impl OpenStream {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        let reply = self.begin(request)?;
        let ctx = self.scoped(ctx);
        let outcome = ctx
            .run(async {
                if let Some(latency) = self.latency {
                    sleep(latency).await;
                }
                match reply {
                    MockReply::Respond(response) => Ok(response),
                    MockReply::Fail(err) => Err(err),
                    MockReply::Stream(events) => {
                        collect(multiplex(&ctx, self.script_stream(events))).await
                    }
                    MockReply::Hang => pending().await,
                }
            })
            .await;
        outcome.map(|response| self.finalize(response)).map_err(|err| self.tag(err))
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError> {
        let reply = self.begin(request)?;
        ctx.check()?;
        let ctx = self.scoped(ctx);
        let events = match reply {
            MockReply::Respond(response) => response_events(&response),
            MockReply::Fail(err) => return Err(self.tag(err)),
            MockReply::Stream(events) => events,
            MockReply::Hang => vec![MockEvent::Stall],
        };
        Ok(multiplex(&ctx, self.script_stream(events)))
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        self.capabilities
    }

    fn name(&self) -> &str {
        &self.name
    }
}
