use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::error::LLMError;
use crate::middleware::Layer;
use crate::provider::{ChunkStream, DynProvider, LLMProvider};
use crate::types::{CapabilityDescriptor, GenerateRequest, GenerateResponse, StreamChunk};

/// Emits a `tracing` event per call: `debug` on start, `info` on success, `warn` on
/// failure or when the call is abandoned before it completes.
///
/// Requests, responses and chunks are passed through untouched; message content is
/// never logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingLayer;

impl LoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Layer for LoggingLayer {
    fn layer(&self, inner: DynProvider) -> DynProvider {
        Arc::new(LoggingProvider { inner })
    }
}

struct LoggingProvider {
    inner: DynProvider,
}

/// End-of-call logging for one call. Logs exactly once; a call dropped before it
/// completed is logged as abandoned with the context's error.
struct CallLog {
    ctx: CallContext,
    provider: String,
    model: String,
    operation: &'static str,
    started: Instant,
    logged: bool,
}

impl CallLog {
    fn start(
        ctx: &CallContext,
        provider: &str,
        request: &GenerateRequest,
        operation: &'static str,
    ) -> Self {
        tracing::debug!(
            provider,
            model = %request.model,
            operation,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "llm call started"
        );
        Self {
            ctx: ctx.clone(),
            provider: provider.to_string(),
            model: request.model.clone(),
            operation,
            started: Instant::now(),
            logged: false,
        }
    }

    fn latency_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn failed(&mut self, err: &LLMError, message: &'static str) {
        self.logged = true;
        tracing::warn!(
            provider = %self.provider,
            model = %self.model,
            operation = self.operation,
            latency_ms = self.latency_ms(),
            kind = %err.kind(),
            error = %err,
            "{}",
            message
        );
    }

    fn response(&mut self, result: Result<&GenerateResponse, &LLMError>) {
        match result {
            Ok(response) => {
                self.logged = true;
                tracing::info!(
                    provider = %self.provider,
                    model = %self.model,
                    operation = self.operation,
                    latency_ms = self.latency_ms(),
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    finish_reason = ?response.finish_reason,
                    "llm call finished"
                );
            }
            Err(err) => self.failed(err, "llm call failed"),
        }
    }

    fn chunk(&mut self, chunk: &StreamChunk) {
        if !chunk.is_final || self.logged {
            return;
        }
        match &chunk.error {
            None => {
                self.logged = true;
                let usage = chunk.usage.unwrap_or_default();
                tracing::info!(
                    provider = %self.provider,
                    model = %self.model,
                    operation = self.operation,
                    latency_ms = self.latency_ms(),
                    chunks = chunk.index + 1,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    finish_reason = ?chunk.finish_reason,
                    "llm stream finished"
                );
            }
            Some(err) => self.failed(err, "llm stream failed"),
        }
    }
}

impl Drop for CallLog {
    fn drop(&mut self) {
        if self.logged {
            return;
        }
        let err = match self.ctx.check() {
            Err(err) => err,
            Ok(()) => LLMError::cancelled("call dropped before completion"),
        };
        self.failed(&err, "llm call abandoned");
    }
}

#[async_trait]
impl LLMProvider for LoggingProvider {
    async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        let mut log = CallLog::start(ctx, self.inner.name(), request, "generate");
        let result = self.inner.generate(ctx, request).await;
        log.response(result.as_ref());
        result
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError> {
        let mut log = CallLog::start(ctx, self.inner.name(), request, "stream");
        match self.inner.stream(ctx, request).await {
            Ok(chunks) => Ok(Box::pin(chunks.inspect(move |chunk| log.chunk(chunk)))),
            Err(err) => {
                log.failed(&err, "llm stream setup failed");
                Err(err)
            }
        }
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        self.inner.capabilities()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::mock::{MockEvent, MockProvider, MockReply};
    use crate::types::{FinishReason, Message, Usage};

    fn request() -> GenerateRequest {
        GenerateRequest::new("m1", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn generate_results_pass_through_unchanged() {
        let expected = GenerateResponse::new(Message::assistant("hello"), FinishReason::Stop)
            .with_usage(Usage::new(1, 1));
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Respond(expected.clone())));
        let bare = mock.generate(&CallContext::new(), &request()).await.expect("bare");
        let logged = LoggingLayer::new()
            .layer(mock.clone())
            .generate(&CallContext::new(), &request())
            .await
            .expect("logged");
        assert_eq!(bare, logged);
    }

    #[tokio::test]
    async fn errors_are_not_swallowed() {
        let blocked = LLMError::content_filtered("blocked");
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Fail(blocked)));
        let provider = LoggingLayer::new().layer(mock);
        let err = provider
            .generate(&CallContext::new(), &request())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContentFiltered);
        assert_eq!(provider.name(), "fake");
    }

    #[tokio::test]
    async fn stream_chunks_pass_through_unchanged() {
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Stream(vec![
            MockEvent::text("He"),
            MockEvent::text("llo"),
            MockEvent::Fail(LLMError::unavailable("reset")),
        ])));
        let chunks: Vec<_> = LoggingLayer::new()
            .layer(mock)
            .stream(&CallContext::new(), &request())
            .await
            .expect("stream")
            .collect()
            .await;

        let text: Vec<_> = chunks.iter().filter_map(|c| c.delta.as_text()).collect();
        assert_eq!(text, vec!["He", "llo"]);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(
            chunks[2].error.as_ref().map(LLMError::kind),
            Some(ErrorKind::ProviderUnavailable)
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (captured, tracing::subscriber::set_default(subscriber))
    }

    #[tokio::test]
    async fn cancelled_generate_logs_an_end_event() {
        let (logs, _guard) = capture();
        let client = crate::LLMClient::builder(Arc::new(
            MockProvider::new("fake").always(MockReply::Hang),
        ))
        .layer(LoggingLayer::new())
        .build();
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = client.generate(&ctx, &request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let text = logs.text();
        assert!(text.contains("llm call started"), "{text}");
        assert!(text.contains("llm call abandoned"), "{text}");
        assert!(text.contains("kind=cancelled"), "{text}");
    }

    #[tokio::test]
    async fn dropped_stream_logs_an_end_event() {
        let (logs, _guard) = capture();
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Stream(vec![
            MockEvent::text("a"),
            MockEvent::Stall,
        ])));
        let mut chunks = LoggingLayer::new()
            .layer(mock)
            .stream(&CallContext::new(), &request())
            .await
            .expect("stream");
        chunks.next().await.expect("first chunk");
        drop(chunks);

        let text = logs.text();
        assert!(text.contains("llm call abandoned"), "{text}");
        assert!(text.contains("operation=\"stream\""), "{text}");
    }
}
