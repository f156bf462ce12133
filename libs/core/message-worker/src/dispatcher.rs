//! Dispatch of a raw payload to its bound handler.

use crate::error::DispatchError;
use crate::handler::HandlerKind;
use crate::registry::HandlerBinding;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;

/// How a dispatch ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Faulted(DispatchError),
}

/// Result of one dispatch cycle.
#[derive(Debug)]
pub struct DispatchResult {
    /// The handler's return value as JSON, when it returned something other than `()`/`null`.
    pub value: Option<serde_json::Value>,
    pub outcome: Outcome,
}

impl DispatchResult {
    fn completed(value: Option<serde_json::Value>) -> Self {
        Self {
            value,
            outcome: Outcome::Completed,
        }
    }

    fn faulted(error: DispatchError) -> Self {
        Self {
            value: None,
            outcome: Outcome::Faulted(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed)
    }

    pub fn error(&self) -> Option<&DispatchError> {
        match &self.outcome {
            Outcome::Completed => None,
            Outcome::Faulted(err) => Some(err),
        }
    }

    /// Collapse into a plain `Result` at an outer boundary.
    pub fn into_result(self) -> Result<Option<serde_json::Value>, DispatchError> {
        match self.outcome {
            Outcome::Completed => Ok(self.value),
            Outcome::Faulted(err) => Err(err),
        }
    }
}

/// Invokes handlers. Stateless; exactly one invocation per call, never retried.
pub struct Dispatcher;

impl Dispatcher {
    /// Decode `payload` when the handler takes an argument, then invoke it.
    ///
    /// Zero-argument handlers never look at the payload. Handler panics are
    /// caught and reported as [`DispatchError::Panicked`].
    pub async fn invoke(binding: &HandlerBinding, payload: &[u8]) -> DispatchResult {
        // Sync handlers run inside `call`, so it is guarded as well as the future
        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| match binding.handler() {
            HandlerKind::ZeroArg(handler) => Ok(handler.call()),
            HandlerKind::OneArg(handler) => handler.call(payload),
        }));
        let call = match prepared {
            Ok(Ok(fut)) => fut,
            Ok(Err(err)) => return DispatchResult::faulted(DispatchError::PayloadDecode(err)),
            Err(panic) => {
                return DispatchResult::faulted(DispatchError::Panicked(panic_message(&*panic)));
            }
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(value)) => DispatchResult::completed(value),
            Ok(Err(err)) => DispatchResult::faulted(DispatchError::Handler(err)),
            Err(panic) => DispatchResult::faulted(DispatchError::Panicked(panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
