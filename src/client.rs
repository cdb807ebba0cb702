use crate::context::CallContext;
use crate::error::LLMError;
use crate::middleware::{Layer, Stack};
use crate::provider::{ChunkStream, DynProvider};
use crate::stream::guard;
use crate::types::{CapabilityDescriptor, GenerateRequest, GenerateResponse};

/// Provider-agnostic entry point: one provider, wrapped in an optional middleware stack.
///
/// Application code talks only to `LLMClient`; swapping the provider behind it does not
/// change the calling code. Every call validates the request, rejects features the
/// provider does not advertise, and honors the [`CallContext`]. Streams returned by
/// [`LLMClient::stream`] always satisfy the chunk contract (indices from 0, exactly one
/// final chunk) even when the provider misbehaves.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use llm_switchboard::{CallContext, LLMClient};
/// # use llm_switchboard::middleware::{RetryLayer, RetryPolicy, TimeoutLayer};
/// # use llm_switchboard::provider::mock::{MockProvider, MockReply};
/// # use llm_switchboard::types::{FinishReason, GenerateRequest, GenerateResponse, Message};
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let provider = MockProvider::new("fake").always(MockReply::Respond(
///     GenerateResponse::new(Message::assistant("hello"), FinishReason::Stop),
/// ));
/// let client = LLMClient::builder(Arc::new(provider))
///     .layer(TimeoutLayer::new(Duration::from_secs(30)))
///     .layer(RetryLayer::new(RetryPolicy::default()))
///     .build();
///
/// let request = GenerateRequest::new("m1", vec![Message::user("hi")]);
/// let response = client.generate(&CallContext::new(), &request).await.unwrap();
/// assert_eq!(response.text(), "hello");
/// # });
/// ```
#[derive(Clone)]
pub struct LLMClient {
    provider: DynProvider,
}

impl LLMClient {
    /// Client calling `provider` directly, without middleware.
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }

    pub fn builder(provider: DynProvider) -> LLMClientBuilder {
        LLMClientBuilder {
            provider,
            stack: Stack::new(),
        }
    }

    /// Performs a complete generation.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` when the request fails validation;
    /// - `UnsupportedFeature` when tools are declared but the provider has no tool support;
    /// - `Cancelled` / `Timeout` when the context fires first;
    /// - otherwise whatever the provider reports.
    pub async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        self.admit(request, false)?;
        ctx.run(self.provider.generate(ctx, request)).await
    }

    /// Starts a streamed generation.
    ///
    /// Setup failures are returned as `Err`; failures after the stream started arrive
    /// as the final chunk's `error`. Dropping the stream releases the provider's
    /// resources.
    pub async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError> {
        self.admit(request, true)?;
        let chunks = ctx.run(self.provider.stream(ctx, request)).await?;
        Ok(guard(ctx, chunks))
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn capabilities(&self) -> CapabilityDescriptor {
        self.provider.capabilities()
    }

    fn admit(&self, request: &GenerateRequest, streaming: bool) -> Result<(), LLMError> {
        request.validate()?;
        let caps = self.provider.capabilities();
        if streaming && !caps.supports_stream {
            return Err(LLMError::unsupported("stream").with_provider(self.provider.name()));
        }
        if !request.tools.is_empty() && !caps.supports_tools {
            return Err(LLMError::unsupported("tools").with_provider(self.provider.name()));
        }
        Ok(())
    }
}

/// Builder assembling the middleware stack around a provider.
pub struct LLMClientBuilder {
    provider: DynProvider,
    stack: Stack,
}

impl LLMClientBuilder {
    /// Adds a layer inside those added before it.
    pub fn layer<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.stack = self.stack.layer(layer);
        self
    }

    /// Appends a prepared stack inside the layers added so far.
    pub fn stack(mut self, stack: Stack) -> Self {
        self.stack = self.stack.extend(stack);
        self
    }

    pub fn build(self) -> LLMClient {
        LLMClient {
            provider: self.stack.apply(self.provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::mock::{MockEvent, MockProvider, MockReply};
    use crate::types::{FinishReason, Message, ToolDefinition, Usage};

    fn request() -> GenerateRequest {
        GenerateRequest::new("m1", vec![Message::user("hi")])
    }

    fn hello() -> MockReply {
        MockReply::Respond(
            GenerateResponse::new(Message::assistant("hello"), FinishReason::Stop)
                .with_usage(Usage::new(1, 1)),
        )
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_provider() {
        let mock = Arc::new(MockProvider::new("fake").always(hello()));
        let client = LLMClient::new(mock.clone());

        let err = client
            .generate(&CallContext::new(), &GenerateRequest::new("m1", Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_features_are_rejected_up_front() {
        let mock = Arc::new(
            MockProvider::new("fake")
                .with_capabilities(CapabilityDescriptor {
                    supports_stream: false,
                    supports_tools: false,
                })
                .always(hello()),
        );
        let client = LLMClient::new(mock.clone());
        let ctx = CallContext::new();

        let err = match client.stream(&ctx, &request()).await {
            Ok(_) => panic!("stream should be rejected"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
        assert_eq!(err.provider(), Some("fake"));

        let with_tools = request().with_tools(vec![ToolDefinition {
            name: "lookup".into(),
            description: None,
            input_schema: Some(json!({ "type": "object" })),
        }]);
        let err = client.generate(&ctx, &with_tools).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn generate_honors_caller_deadline() {
        let client = LLMClient::new(Arc::new(MockProvider::new("fake").always(MockReply::Hang)));
        let ctx = CallContext::new().with_timeout(Duration::from_secs(3));
        let err = client.generate(&ctx, &request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn stream_chunks_are_renumbered_and_terminated() {
        let mock = Arc::new(MockProvider::new("fake").always(MockReply::Stream(vec![
            MockEvent::text("He"),
            MockEvent::text("llo"),
        ])));
        let client = LLMClient::new(mock);
        let chunks: Vec<_> = client
            .stream(&CallContext::new(), &request())
            .await
            .expect("stream")
            .collect()
            .await;

        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert_eq!(
            chunks[2].error.as_ref().map(LLMError::kind),
            Some(ErrorKind::ProviderUnavailable)
        );
    }

    #[test]
    fn builder_applies_layers_and_keeps_identity() {
        let mock = Arc::new(MockProvider::new("fake").always(hello()));
        let client = LLMClient::builder(mock)
            .layer(crate::middleware::LoggingLayer::new())
            .build();
        assert_eq!(client.provider_name(), "fake");
        assert!(client.capabilities().supports_stream);
    }
}
