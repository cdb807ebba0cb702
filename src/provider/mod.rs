use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;

use crate::context::CallContext;
use crate::error::LLMError;
use crate::types::{CapabilityDescriptor, GenerateRequest, GenerateResponse, StreamChunk};

pub mod mock;

/// Lazy, finite, ordered sequence of chunks produced by [`LLMProvider::stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// The contract every backend adapter implements to plug into the client.
///
/// Adapters translate [`GenerateRequest`]s into their wire protocol and map replies and
/// failures back into the crate's types. Middleware implements the same trait, so a
/// wrapped provider is indistinguishable from a bare one.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Submits the request and waits for the complete response.
    ///
    /// Implementations must stop work and return an [`ErrorKind::Cancelled`] error once
    /// `ctx` fires.
    ///
    /// [`ErrorKind::Cancelled`]: crate::error::ErrorKind::Cancelled
    async fn generate(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, LLMError>;

    /// Starts a streamed generation.
    ///
    /// Returns as soon as the stream is set up. Failures after that point are reported
    /// in-band as the terminal chunk; adapters build the returned stream with
    /// [`crate::stream::multiplex`] to get that behavior.
    async fn stream(
        &self,
        ctx: &CallContext,
        request: &GenerateRequest,
    ) -> Result<ChunkStream, LLMError>;

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::default()
    }

    /// Provider name used in logs and error metadata.
    fn name(&self) -> &str;
}

/// Thread-safe provider handle.
pub type DynProvider = Arc<dyn LLMProvider>;
