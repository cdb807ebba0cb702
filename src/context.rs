//! Per-call cancellation and deadline propagation.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, LLMError};

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    /// Kind reported when this deadline is the one that fires.
    kind: ErrorKind,
}

impl Deadline {
    fn error(self) -> LLMError {
        match self.kind {
            ErrorKind::Timeout => LLMError::timeout("call exceeded its time limit"),
            _ => LLMError::cancelled("caller deadline exceeded"),
        }
    }
}

fn tighten(current: Option<Deadline>, candidate: Deadline) -> Deadline {
    match current {
        Some(existing) if existing.at <= candidate.at => existing,
        _ => candidate,
    }
}

/// Cancellation token plus optional deadline carried through every provider call.
///
/// A context flows from the caller through the client and each middleware down to
/// the provider. Cancelling it, or letting its deadline pass, makes every in-flight
/// operation bound to it resolve with an error:
///
/// - caller cancellation and caller deadlines produce [`ErrorKind::Cancelled`];
/// - deadlines installed by [`CallContext::with_call_timeout`] produce
///   [`ErrorKind::Timeout`].
///
/// # Examples
///
/// ```
/// # use llm_switchboard::context::CallContext;
/// # use llm_switchboard::error::ErrorKind;
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let ctx = CallContext::new();
/// ctx.cancel();
/// let err = ctx
///     .run(async { Ok::<_, llm_switchboard::LLMError>(42) })
///     .await
///     .unwrap_err();
/// assert_eq!(err.kind(), ErrorKind::Cancelled);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Deadline>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an existing token, e.g. one shared with the rest of an application.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Adds a caller deadline `timeout` from now; the earlier deadline wins.
    ///
    /// A timeout too large to represent as an instant (e.g. `Duration::MAX`) adds no
    /// deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => self.with_deadline(at),
            None => self,
        }
    }

    /// Adds a caller deadline; the earlier deadline wins.
    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(tighten(
            self.deadline,
            Deadline {
                at,
                kind: ErrorKind::Cancelled,
            },
        ));
        self
    }

    /// Child context: cancelled with its parent, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context with an additional per-call limit.
    ///
    /// The stricter of the inherited deadline and `timeout` applies. When the per-call
    /// limit is the one that fires, the resulting error is [`ErrorKind::Timeout`]. A limit
    /// too large to represent leaves the inherited deadline in place.
    pub fn with_call_timeout(&self, timeout: Duration) -> Self {
        let Some(at) = Instant::now().checked_add(timeout) else {
            return self.child();
        };
        let candidate = Deadline {
            at,
            kind: ErrorKind::Timeout,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(tighten(self.deadline, candidate)),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|deadline| deadline.at)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.at.saturating_duration_since(Instant::now()))
    }

    /// Fails fast when the context is already cancelled or expired.
    pub fn check(&self) -> Result<(), LLMError> {
        if self.token.is_cancelled() {
            return Err(LLMError::cancelled("call cancelled by caller"));
        }
        match self.deadline {
            Some(deadline) if deadline.at <= Instant::now() => Err(deadline.error()),
            _ => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) -> LLMError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => LLMError::cancelled("call cancelled by caller"),
                _ = sleep_until(deadline.at) => deadline.error(),
            },
            None => {
                self.token.cancelled().await;
                LLMError::cancelled("call cancelled by caller")
            }
        }
    }

    /// Drives `fut` unless the context fires first, in which case `fut` is dropped.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, LLMError>
    where
        F: Future<Output = Result<T, LLMError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.cancelled() => Err(err),
            result = fut => result,
        }
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), LLMError> {
        self.run(async {
            sleep(duration).await;
            Ok(())
        })
        .await
    }
}
