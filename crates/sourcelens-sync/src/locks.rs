use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Table of per-directory async locks. Entries live as long as someone holds
/// the slot; distinct paths never contend.
pub struct PathLocks<T> {
    entries: Mutex<HashMap<PathBuf, Weak<PathSlot<T>>>>,
}

pub struct PathSlot<T> {
    gate: tokio::sync::Mutex<Option<T>>,
    generation: AtomicU64,
}

/// How an exclusive section ended for a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusive<T> {
    /// This caller ran the work.
    Ran(T),
    /// Another caller completed the work while this one waited; its outcome
    /// is shared.
    Joined(T),
}

impl<T> Default for PathLocks<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PathLocks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, path: &Path) -> Arc<PathSlot<T>> {
        let mut entries = self.lock();
        if let Some(slot) = entries.get(path).and_then(Weak::upgrade) {
            return slot;
        }

        entries.retain(|_, slot| slot.strong_count() > 0);
        let slot = Arc::new(PathSlot {
            gate: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        entries.insert(path.to_path_buf(), Arc::downgrade(&slot));
        slot
    }

    /// True while some caller holds the slot for `path`, whether it is
    /// running work or waiting for it.
    pub fn is_held(&self, path: &Path) -> bool {
        self.lock()
            .get(path)
            .is_some_and(|slot| slot.strong_count() > 0)
    }

    /// Number of paths currently held by at least one caller.
    pub fn active(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Weak<PathSlot<T>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> PathSlot<T> {
    /// Runs `work` while holding the slot. A caller that had to wait while
    /// another caller finished `run_exclusive` on this slot receives that
    /// outcome instead of running `work` again.
    pub async fn run_exclusive<F, Fut>(&self, work: F) -> Exclusive<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let observed = self.generation.load(Ordering::Acquire);
        let mut last = self.gate.lock().await;
        if self.generation.load(Ordering::Acquire) != observed
            && let Some(outcome) = last.as_ref()
        {
            return Exclusive::Joined(outcome.clone());
        }

        let outcome = work().await;
        *last = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        Exclusive::Ran(outcome)
    }

    /// Runs `work` while holding the slot without recording an outcome for
    /// waiters.
    pub async fn with_lock<F, Fut, R>(&self, work: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.gate.lock().await;
        work().await
    }
}
