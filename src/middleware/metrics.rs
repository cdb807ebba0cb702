use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::error::{ErrorKind, LLMError};
use crate::middleware::Layer;
use crate::provider::{ChunkStream, DynProvider, LLMProvider};
use crate::types::{
    CapabilityDescriptor, FinishReason, GenerateRequest, GenerateResponse, StreamChunk, Usage,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Generate,
    Stream,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Generate => "generate",
            Self::Stream => "stream",
        })
    }
}

/// Outcome of one completed call.
#[derive(Clone, Debug, PartialEq)]
pub struct CallRecord {
    pub provider: String,
    pub model: String,
    pub operation: Operation,
    /// From invocation to the response, or to the final chunk for streams.
    pub latency: Duration,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
    pub error_kind: Option<ErrorKind>,
}

impl CallRecord {
    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }
}

/// Receives call outcomes from [`MetricsLayer`].
///
/// Implementations must be cheap and must not block; they run inline with the call.
pub trait CallObserver: Send + Sync {
    fn on_start(&self, _provider: &str, _model: &str, _operation: Operation) {}

    fn on_finish(&self, record: &CallRecord);
}

/// Reports every call to a [`CallObserver`] without touching requests or results.
///
/// A call abandoned before it completes is still reported: a `generate` future
/// dropped by an outer timeout or by caller cancellation records the context's error,
/// and a stream dropped before its final chunk records `Cancelled`.
#[derive(Clone)]
pub struct MetricsLayer {
    observer: Arc<dyn CallObserver>,
}

impl MetricsLayer {
    pub fn new(observer: Arc<dyn CallObserver>) -> Self {
        Self { observer }
    }
}

impl Layer for MetricsLayer {
    fn layer(&self, inner: DynProvider) -> DynProvider {
        Arc::new(MetricsProvider {
            inner,
            observer: self.observer.clone(),
        })
    }
}

/// Observer that keeps every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    started: AtomicUsize,
    records: Mutex<Vec<CallRecord>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.lock().clone()
    }

    pub fn errors(&self) -> usize {
        self.lock().iter().filter(|record| record.is_error()).count()
    }

    /// Usage summed over all finished calls.
    pub fn total_usage(&self) -> Usage {
        self.lock().iter().fold(Usage::default(), |mut total, record| {
            total.accumulate(&record.usage);
            total
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CallRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CallObserver for InMemoryMetrics {
    fn on_start(&self, _provider: &str, _model: &str, _operation: Operation) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_finish(&self, record: &CallRecord) {
        self.lock().push(record.clone());
    }
}

struct MetricsProvider {
    inner: DynProvider,
    observer: Arc<dyn CallObserver>,
}

/// Call in flight. Reports exactly once; dropping it unreported records the context's
/// error, or a cancellation when the context is still live.
struct Pending {
    observer: Arc<dyn CallObserver>,
    ctx: CallContext,
    provider: String,
    model: String,
    operation: Operation,
    started: Instant,
    reported: bool,
}

impl Pending {
    fn start(
        observer: &Arc<dyn CallObserver>,
        ctx: &CallContext,
        provider: &str,
        model: &str,
        operation: Operation,
    ) -> Self {
        observer.on_start(provider, model, operation);
        Self {
            observer: observer.clone(),
            ctx: ctx.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            operation,
            started: Instant::now(),
            reported: false,
        }
    }

    fn finish(
        &mut self,
        usage: Usage,
        finish_reason: Option<FinishReason>,
        error: Option<&LLMError>,
    ) {
        if self.reported {
            return;
        }
        self.reported = true;
        let record = CallRecord {
            provider: std::mem::take(&mut self.provider),
            model: std::mem::take(&mut self.model),
            operation: self.operation,
            latency: self.started.elapsed(),
            usage,
            finish_reason,
            error_kind: error.map(LLMError::kind),
        };
        self.observer.on_finish(&record);
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.reported {
            let err = match self.ctx.check() {
                Err(err) => err,
                Ok(()) => LLMError::cancelled("call dropped before completion"),
            };
            self.finish(Usage::default(), None, Some(&err));
        }
    }
}

#[async_trait]
impl LLMProvider for MetricsProvider {
    async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        let mut pending = Pending::start(
            &self.observer,
            ctx,
            self.inner.name(),
            &request.model,
            Operation::Generate,
        );
        let result = self.inner.generate(ctx, request).await;
        match &result {
            Ok(response) => pending.finish(response.usage, Some(response.finish_reason), None),
            Err(err) => pending.finish(Usage::default(), None, Some(err)),
        }
        result
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError> {
        let mut pending = Pending::start(
            &self.observer,
            ctx,
            self.inner.name(),
            &request.model,
            Operation::Stream,
        );
        match self.inner.stream(ctx, request).await {
            Ok(chunks) => Ok(Box::pin(ObservedStream {
                inner: chunks,
                pending,
            })),
            Err(err) => {
                pending.finish(Usage::default(), None, Some(&err));
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

/// Passes chunks through and reports once the final chunk goes by.
struct ObservedStream {
    inner: ChunkStream,
    pending: Pending,
}

impl Stream for ObservedStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_final {
                    this.pending.finish(
                        chunk.usage.unwrap_or_default(),
                        chunk.finish_reason,
                        chunk.error.as_ref(),
                    );
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                let err = LLMError::unavailable("stream ended without a final chunk");
                this.pending.finish(Usage::default(), None, Some(&err));
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::provider::mock::{MockEvent, MockProvider, MockReply};
    use crate::types::Message;

    fn request() -> GenerateRequest {
        GenerateRequest::new("m1", vec![Message::user("hi")])
    }

    fn hello() -> MockReply {
        MockReply::Respond(
            GenerateResponse::new(Message::assistant("hello"), FinishReason::Stop)
                .with_usage(Usage::new(3, 2)),
        )
    }

    fn observed(mock: MockProvider) -> (DynProvider, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let provider = MetricsLayer::new(metrics.clone()).layer(Arc::new(mock));
        (provider, metrics)
    }

    #[tokio::test]
    async fn records_successful_generate() {
        let (provider, metrics) = observed(MockProvider::new("fake").always(hello()));
        let response = provider
            .generate(&CallContext::new(), &request())
            .await
            .expect("response");
        assert_eq!(response.text(), "hello");

        let records = metrics.records();
        assert_eq!(metrics.started(), 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "fake");
        assert_eq!(records[0].model, "m1");
        assert_eq!(records[0].operation, Operation::Generate);
        assert_eq!(records[0].usage, Usage::new(3, 2));
        assert_eq!(records[0].finish_reason, Some(FinishReason::Stop));
        assert!(!records[0].is_error());
    }

    #[tokio::test]
    async fn records_failures_without_hiding_them() {
        let (provider, metrics) = observed(
            MockProvider::new("fake").always(MockReply::Fail(LLMError::authentication("denied"))),
        );
        let err = provider
            .generate(&CallContext::new(), &request())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(metrics.errors(), 1);
        assert_eq!(
            metrics.records()[0].error_kind,
            Some(ErrorKind::AuthenticationFailed)
        );
    }

    #[tokio::test]
    async fn stream_is_recorded_at_final_chunk() {
        let (provider, metrics) = observed(MockProvider::new("fake").always(hello()));
        let mut chunks = provider
            .stream(&CallContext::new(), &request())
            .await
            .expect("stream");

        let first = chunks.next().await.expect("first chunk");
        assert_eq!(first.delta.as_text(), Some("hello"));
        assert!(metrics.records().is_empty());

        let last = chunks.next().await.expect("final chunk");
        assert!(last.is_final);
        let records = metrics.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::Stream);
        assert_eq!(records[0].usage, Usage::new(3, 2));
        assert_eq!(metrics.total_usage(), Usage::new(3, 2));
    }

    #[tokio::test]
    async fn abandoned_stream_is_recorded_as_cancelled() {
        let (provider, metrics) = observed(MockProvider::new("fake").always(MockReply::Stream(
            vec![MockEvent::text("a"), MockEvent::text("b"), MockEvent::Stall],
        )));
        let mut chunks = provider
            .stream(&CallContext::new(), &request())
            .await
            .expect("stream");
        chunks.next().await.expect("first chunk");
        drop(chunks);

        let records = metrics.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_generate_is_recorded() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let client = crate::LLMClient::builder(Arc::new(
            MockProvider::new("fake").always(MockReply::Hang),
        ))
        .layer(MetricsLayer::new(metrics.clone()))
        .build();
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = client.generate(&ctx, &request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let records = metrics.records();
        assert_eq!(records.len(), metrics.started());
        assert_eq!(records[0].operation, Operation::Generate);
        assert_eq!(records[0].error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn generate_cut_off_by_outer_timeout_is_recorded() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let client = crate::LLMClient::builder(Arc::new(
            MockProvider::new("fake").always(MockReply::Hang),
        ))
        .layer(crate::middleware::TimeoutLayer::new(Duration::from_secs(1)))
        .layer(MetricsLayer::new(metrics.clone()))
        .build();

        let err = client
            .generate(&CallContext::new(), &request())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(metrics.started(), 1);
        assert_eq!(metrics.records()[0].error_kind, Some(ErrorKind::Timeout));
    }
}
