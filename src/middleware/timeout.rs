use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::context::CallContext;
use crate::error::LLMError;
use crate::middleware::Layer;
use crate::provider::{ChunkStream, DynProvider, LLMProvider};
use crate::stream::guard;
use crate::types::{CapabilityDescriptor, GenerateRequest, GenerateResponse};

/// Bounds each call to a fixed duration.
///
/// A call that runs past the limit fails with `Timeout` and the inner work is dropped.
/// For streams the limit covers the whole stream, not each chunk. If the caller's own
/// deadline is earlier, it fires first and the call reports `Cancelled` instead.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Layer for the configured `requestTimeout`, if any.
    pub fn from_config(config: &ProviderConfig) -> Option<Self> {
        config.request_timeout.map(Self::new)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Layer for TimeoutLayer {
    fn layer(&self, inner: DynProvider) -> DynProvider {
        Arc::new(TimeoutProvider {
            inner,
            timeout: self.timeout,
        })
    }
}

struct TimeoutProvider {
    inner: DynProvider,
    timeout: Duration,
}

#[async_trait]
impl LLMProvider for TimeoutProvider {
    async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        let scoped = ctx.with_call_timeout(self.timeout);
        scoped.run(self.inner.generate(&scoped, request)).await
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError> {
        let scoped = ctx.with_call_timeout(self.timeout);
        let chunks = scoped.run(self.inner.stream(&scoped, request)).await?;
        Ok(guard(&scoped, chunks))
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
    use futures_util::StreamExt;

    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::mock::{MockEvent, MockProvider, MockReply};
    use crate::types::{FinishReason, Message};

    fn request() -> GenerateRequest {
        GenerateRequest::new("m1", vec![Message::user("hi")])
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generate_times_out() {
        let mock = Arc::new(
            MockProvider::new("fake")
                .with_latency(Duration::from_secs(10))
                .always(MockReply::Respond(GenerateResponse::new(
                    Message::assistant("late"),
                    FinishReason::Stop,
                ))),
        );
        let provider = TimeoutLayer::new(Duration::from_secs(1)).layer(mock);
        let err = provider
            .generate(&CallContext::new(), &request())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_generate_passes_through() {
        let mock = Arc::new(
            MockProvider::new("fake")
                .with_latency(Duration::from_millis(100))
                .always(MockReply::Respond(GenerateResponse::new(
                    Message::assistant("quick"),
                    FinishReason::Stop,
                ))),
        );
        let provider = TimeoutLayer::new(Duration::from_secs(1)).layer(mock);
        let response = provider
            .generate(&CallContext::new(), &request())
            .await
            .expect("response");
        assert_eq!(response.text(), "quick");
    }

    #[tokio::test(start_paused = true)]
    async fn stricter_caller_deadline_reports_cancelled() {
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Hang));
        let provider = TimeoutLayer::new(Duration::from_secs(30)).layer(mock);
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let err = provider.generate(&ctx, &request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_ends_with_timeout_chunk() {
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Stream(vec![
            MockEvent::text("He"),
            MockEvent::Stall,
        ])));
        let provider = TimeoutLayer::new(Duration::from_secs(2)).layer(mock.clone());
        let chunks: Vec<_> = provider
            .stream(&CallContext::new(), &request())
            .await
            .expect("stream")
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].delta.as_text(), Some("He"));
        let last = &chunks[1];
        assert!(last.is_final);
        assert_eq!(last.error.as_ref().map(LLMError::kind), Some(ErrorKind::Timeout));
        assert_eq!(mock.open_streams(), 0);
    }

    #[tokio::test]
    async fn unbounded_timeout_adds_no_deadline() {
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Respond(
            GenerateResponse::new(Message::assistant("ok"), FinishReason::Stop),
        )));
        let provider = TimeoutLayer::new(Duration::MAX).layer(mock);
        let response = provider
            .generate(&CallContext::new(), &request())
            .await
            .expect("response");
        assert_eq!(response.text(), "ok");
    }

    #[test]
    fn built_from_configured_request_timeout() {
        let config = ProviderConfig::default().with_request_timeout(Duration::from_secs(7));
        let layer = TimeoutLayer::from_config(&config).expect("layer");
        assert_eq!(layer.timeout(), Duration::from_secs(7));
        assert!(TimeoutLayer::from_config(&ProviderConfig::default()).is_none());
    }
}
