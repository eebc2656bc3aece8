//! Exception barrier around every reactor-invoked continuation.
//!
//! Failures inside a continuation have no caller stack to unwind into, so
//! they are funneled to `on_error` (or logged) instead of escaping into the
//! reactor. Direct synchronous calls such as `write` do not pass through
//! here; their errors are returned to the caller.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};

use super::{EventSocket, Inner};

/// Record what is being attempted so a later failure can be annotated. Used
/// only for error reports, never as control flow.
pub(crate) fn set_context(inner: &Rc<RefCell<Inner>>, context: impl Into<String>) {
    inner.borrow_mut().error_context = Some(context.into());
}

/// Run a fallible continuation, routing any error to the one error-handling
/// path. The pending context is always cleared afterwards.
pub(crate) fn guarded(inner: &Rc<RefCell<Inner>>, f: impl FnOnce() -> Result<()>) {
    if let Err(err) = f() {
        handle_error(inner, &err);
    }
    inner.borrow_mut().error_context = None;
}

/// Deliver an error to `on_error`, or log it when no handler is set.
pub(crate) fn handle_error(inner: &Rc<RefCell<Inner>>, err: &Error) {
    let (cb, context) = {
        let b = inner.borrow();
        (b.on_error.clone(), b.error_context.clone())
    };
    let context = context.unwrap_or_else(|| "unknown error".to_string());
    match cb {
        Some(cb) => {
            let sock = EventSocket::from_inner(Rc::clone(inner));
            cb(&sock, &context, err);
        }
        None => tracing::error!(context = %context, error = %err, "unhandled socket error"),
    }
}
