//! Tracks which task ids currently have an active invocation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of task ids with an invocation in flight.
///
/// Claims are all-or-none: either every requested id is claimed or none is.
/// A claim is released when its [`InFlightGuard`] is dropped, which also
/// covers timeouts and panics unwinding through the holder.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    active: Arc<Mutex<HashSet<String>>>,
}

impl InFlightSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every id in `task_ids`, or none if any is already claimed.
    ///
    /// Duplicate ids in `task_ids` are claimed once.
    pub fn try_acquire(&self, task_ids: &[&str]) -> Option<InFlightGuard> {
        let mut active = self.lock();
        if task_ids.iter().any(|id| active.contains(*id)) {
            return None;
        }

        let mut claimed: Vec<String> = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            if active.insert((*id).to_string()) {
                claimed.push((*id).to_string());
            }
        }

        Some(InFlightGuard {
            set: self.clone(),
            task_ids: claimed,
        })
    }

    /// Whether `task_id` is currently claimed.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.lock().contains(task_id)
    }

    /// Currently claimed ids, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-update.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases its claimed task ids on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlightSet,
    task_ids: Vec<String>,
}

impl InFlightGuard {
    /// Ids held by this guard.
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut active = self.set.lock();
        for id in &self.task_ids {
            active.remove(id);
        }
    }
}
