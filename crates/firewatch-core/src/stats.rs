//! Counters owned by a routine and shared with its control surface.

use std::sync::Arc;

use parking_lot::Mutex;

/// Statistics that can be zeroed by an explicit reset request.
pub trait Resettable {
    fn reset(&mut self);
}

/// Cloneable handle to a statistics value behind a lock.
///
/// Writers go through [`SharedStats::update`]; readers take a snapshot so the
/// lock is never held across an `.await`.
#[derive(Debug)]
pub struct SharedStats<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStats<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Default> Default for SharedStats<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> SharedStats<S> {
    pub fn new(initial: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<S: Clone> SharedStats<S> {
    pub fn snapshot(&self) -> S {
        self.inner.lock().clone()
    }
}

impl<S: Resettable> SharedStats<S> {
    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Counter {
        hits: u64,
    }

    impl Resettable for Counter {
        fn reset(&mut self) {
            self.hits = 0;
        }
    }

    #[test]
    fn clones_share_the_same_counters() {
        let stats = SharedStats::<Counter>::default();
        let other = stats.clone();
        other.update(|c| c.hits += 3);
        assert_eq!(stats.snapshot().hits, 3);

        stats.reset();
        assert_eq!(other.snapshot().hits, 0);
    }
}
