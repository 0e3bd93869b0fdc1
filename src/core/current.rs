//! Thread-local handle of the sandbox the calling thread works for.
//! Set on create and bind, cleared on unbind and release.

use crate::config::types::SandboxId;
use std::cell::Cell;

thread_local! {
    static CURRENT: Cell<Option<SandboxId>> = const { Cell::new(None) };
}

pub fn get() -> Option<SandboxId> {
    CURRENT.with(Cell::get)
}

pub fn set(id: SandboxId) {
    CURRENT.with(|current| current.set(Some(id)));
}

pub fn clear() {
    CURRENT.with(|current| current.set(None));
}

/// Clear the handle only if it still points at `id`
pub fn clear_if(id: SandboxId) {
    CURRENT.with(|current| {
        if current.get() == Some(id) {
            current.set(None);
        }
    });
}
