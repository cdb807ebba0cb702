//! Provider-agnostic LLM client abstraction.
//!
//! Applications build requests from the types in [`types`], send them through an
//! [`LLMClient`], and get back normalized responses or chunk streams, whatever
//! provider sits behind the client. Cross-cutting behavior (retries, timeouts,
//! logging, metrics) is added by stacking [`middleware`] layers around the provider
//! without changing calling code.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod types;

pub use client::{LLMClient, LLMClientBuilder};
pub use context::CallContext;
pub use error::{ErrorKind, LLMError};
pub use provider::{ChunkStream, DynProvider, LLMProvider};
pub use registry::ProviderRegistry;
pub use types::*;
