/// Tracking of temporary images (luminance copies, masks, scratch clones)
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    open: BTreeSet<String>,
    closed: usize,
}

/// Registry of open temporaries, shared by a session and its helpers.
///
/// A temporary is closed when its `Temporary` handle is dropped, so
/// temporaries cannot outlive the registry's bookkeeping even when a
/// loop exits early through `?`.
#[derive(Debug, Clone, Default)]
pub struct TempRegistry {
    state: Rc<RefCell<RegistryState>>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` as an open temporary named `<prefix>_tmp_<n>`
    pub fn track<T>(&self, prefix: &str, value: T) -> Temporary<T> {
        let id = {
            let mut state = self.state.borrow_mut();
            state.next_id += 1;
            let id = format!("{}_tmp_{}", prefix, state.next_id);
            state.open.insert(id.clone());
            id
        };
        tracing::debug!("Opened temporary {}", id);
        Temporary {
            id,
            value,
            registry: self.clone(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.state.borrow().open.len()
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.state.borrow().open.iter().cloned().collect()
    }

    /// Number of temporaries closed so far
    pub fn closed_count(&self) -> usize {
        self.state.borrow().closed
    }

    fn release(&self, id: &str) {
        let mut state = self.state.borrow_mut();
        if state.open.remove(id) {
            state.closed += 1;
            tracing::debug!("Closed temporary {}", id);
        }
    }
}

/// Handle to a tracked temporary; dropping it closes the temporary
#[derive(Debug)]
pub struct Temporary<T> {
    id: String,
    value: T,
    registry: TempRegistry,
}

impl<T> Temporary<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Close now (equivalent to dropping the handle)
    pub fn close(self) {}
}

impl<T> Deref for Temporary<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Temporary<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Temporary<T> {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}
