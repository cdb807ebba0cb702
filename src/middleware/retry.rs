use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use rand::Rng;
use tokio::time::Instant;

use crate::context::CallContext;
use crate::error::LLMError;
use crate::middleware::Layer;
use crate::provider::{ChunkStream, DynProvider, LLMProvider};
use crate::types::{CapabilityDescriptor, GenerateRequest, GenerateResponse, StreamChunk};

/// Jitter strategy applied to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Always use the capped exponential delay.
    None,
    /// Pick uniformly in `[0, capped_delay]`.
    Full,
}

/// Exponential backoff calculator: `min(base * 2^attempt, max)`, then jittered.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: Jitter::Full,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let capped_ms = capped_ms.min(u64::MAX as u128) as u64;

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Full => rand::rng().random_range(0..=capped_ms),
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay_ms)
    }

    /// Delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Limits and pacing for [`RetryLayer`].
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Budget across all attempts and waits; no retry starts past it.
    pub max_elapsed: Duration,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_backoff, self.max_backoff).with_jitter(self.jitter)
    }
}

/// Re-issues calls that fail with a retryable [`ErrorKind`](crate::error::ErrorKind).
///
/// For streams, only failures before any chunk has reached the caller are retried:
/// setup errors and a failed first chunk. Once output has been delivered, the stream
/// is passed through untouched.
#[derive(Clone, Debug, Default)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Layer for RetryLayer {
    fn layer(&self, inner: DynProvider) -> DynProvider {
        Arc::new(RetryProvider {
            inner,
            policy: self.policy.clone(),
        })
    }
}

struct RetryProvider {
    inner: DynProvider,
    policy: RetryPolicy,
}

/// Bookkeeping shared by every attempt of one call.
///
/// `generate` borrows the caller's request; streams own a copy because re-opening
/// may happen after `stream()` has returned.
struct Attempts<'a> {
    inner: DynProvider,
    policy: RetryPolicy,
    ctx: CallContext,
    request: Cow<'a, GenerateRequest>,
    started: Instant,
    backoff: ExponentialBackoff,
    attempt: u32,
}

impl<'a> Attempts<'a> {
    fn new(
        inner: DynProvider,
        policy: RetryPolicy,
        ctx: CallContext,
        request: Cow<'a, GenerateRequest>,
    ) -> Self {
        let backoff = policy.backoff();
        Self {
            inner,
            policy,
            ctx,
            request,
            started: Instant::now(),
            backoff,
            attempt: 1,
        }
    }

    /// Delay before the next attempt, or the error to surface when giving up.
    fn schedule(&mut self, err: LLMError) -> Result<Duration, LLMError> {
        if !err.is_retryable() {
            return Err(err);
        }
        if self.attempt >= self.policy.max_attempts {
            tracing::warn!(
                provider = self.inner.name(),
                attempts = self.attempt,
                kind = %err.kind(),
                "retries exhausted"
            );
            return Err(err);
        }

        let mut delay = self.backoff.next_delay();
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint);
        }
        if self.started.elapsed().saturating_add(delay) > self.policy.max_elapsed {
            tracing::warn!(
                provider = self.inner.name(),
                attempts = self.attempt,
                kind = %err.kind(),
                "retry budget exhausted"
            );
            return Err(err);
        }

        tracing::debug!(
            provider = self.inner.name(),
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            kind = %err.kind(),
            error = %err,
            "retrying after retryable failure"
        );
        self.attempt += 1;
        Ok(delay)
    }

    async fn generate(&mut self) -> Result<GenerateResponse, LLMError> {
        loop {
            match self.inner.generate(&self.ctx, &*self.request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let delay = self.schedule(err)?;
                    self.ctx.sleep(delay).await?;
                }
            }
        }
    }

    async fn open(&mut self) -> Result<ChunkStream, LLMError> {
        loop {
            match self.inner.stream(&self.ctx, &*self.request).await {
                Ok(chunks) => return Ok(chunks),
                Err(err) => {
                    let delay = self.schedule(err)?;
                    self.ctx.sleep(delay).await?;
                }
            }
        }
    }

    /// Waits for the first chunk, re-opening the stream while it is a retryable failure.
    async fn settle(mut self, mut chunks: ChunkStream) -> ChunkStream {
        loop {
            let Some(first) = chunks.next().await else {
                return chunks;
            };
            let retryable =
                first.is_final && first.error.as_ref().is_some_and(LLMError::is_retryable);
            let err = match first.error.clone() {
                Some(err) if retryable => err,
                _ => return Box::pin(stream::iter([first]).chain(chunks)),
            };
            drop(chunks);

            let delay = match self.schedule(err) {
                Ok(delay) => delay,
                Err(_) => return single(first),
            };
            let reopened = match self.ctx.sleep(delay).await {
                Ok(()) => self.open().await,
                Err(err) => Err(err),
            };
            chunks = match reopened {
                Ok(chunks) => chunks,
                Err(err) => return single(StreamChunk::failed(0, err, Default::default())),
            };
        }
    }
}

fn single(chunk: StreamChunk) -> ChunkStream {
    Box::pin(stream::iter([chunk]))
}

#[async_trait]
impl LLMProvider for RetryProvider {
    async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        Attempts::new(
            self.inner.clone(),
            self.policy.clone(),
            ctx.clone(),
            Cow::Borrowed(request),
        )
        .generate()
        .await
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError> {
        let mut attempts = Attempts::new(
            self.inner.clone(),
            self.policy.clone(),
            ctx.clone(),
            Cow::Owned(request.clone()),
        );
        let chunks = attempts.open().await?;
        Ok(Box::pin(stream::once(attempts.settle(chunks)).flatten()))
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        self.inner.capabilities()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
