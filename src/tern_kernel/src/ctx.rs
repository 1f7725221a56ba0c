//! Calling-context checks.
use crate::{error::BadContextError, KernelTraits, Port};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: Port>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable — i.e. the caller could not
/// legally transition into the Waiting state — return `Err(BadContext)`.
///
/// A context is waitable iff it's a task context. Interrupt handlers and
/// the boot phase may use the polling variants only.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    expect_task_context::<Traits>()
}
