//! Contract-preserving wrappers around [`LLMProvider`](crate::provider::LLMProvider).
//!
//! Each middleware is itself a provider holding an inner provider, so wrappers stack
//! freely. A [`Stack`] applies layers in the order they were declared: the first
//! layer is the outermost one and sees calls first.

use std::sync::Arc;

use crate::provider::DynProvider;

pub mod logging;
pub mod metrics;
pub mod retry;
pub mod timeout;

pub use logging::LoggingLayer;
pub use metrics::{CallObserver, CallRecord, InMemoryMetrics, MetricsLayer, Operation};
pub use retry::{ExponentialBackoff, Jitter, RetryLayer, RetryPolicy};
pub use timeout::TimeoutLayer;

/// Factory wrapping a provider in one middleware.
pub trait Layer: Send + Sync {
    fn layer(&self, inner: DynProvider) -> DynProvider;
}

/// Ordered list of layers, first = outermost.
///
/// Applying `[a, b]` yields `a(b(provider))`, which is the same as applying `[a]` to
/// the result of applying `[b]`; splitting a stack never changes the wrapping order.
#[derive(Clone, Default)]
pub struct Stack {
    layers: Vec<Arc<dyn Layer>>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer inside every layer added before it.
    pub fn layer<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Appends every layer of `inner`, nested inside this stack's layers.
    pub fn extend(mut self, inner: Stack) -> Self {
        self.layers.extend(inner.layers);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps `provider`, innermost layer first.
    pub fn apply(&self, provider: DynProvider) -> DynProvider {
        self.layers
            .iter()
            .rev()
            .fold(provider, |inner, layer| layer.layer(inner))
    }
}
