//! Current-translator tracking.
//!
//! At any point inside translator code, the "current translator" names the
//! node whose code is executing; it feeds log context and is saved alongside
//! in-flight RPC calls so replies are processed under the submitting
//! translator's scope. Wind, unwind and reply delivery save and restore it
//! across every boundary.

use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Restores the previous scope on drop.
#[derive(Debug)]
pub struct ScopeGuard {
    _private: (),
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Enter `name`'s scope for the lifetime of the returned guard.
pub fn enter(name: &str) -> ScopeGuard {
    CURRENT.with(|stack| {
        stack.borrow_mut().push(name.to_owned());
    });
    ScopeGuard { _private: () }
}

/// Name of the translator whose code is executing on this thread.
pub fn current() -> String {
    CURRENT.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(|| "(top)".to_owned())
    })
}
