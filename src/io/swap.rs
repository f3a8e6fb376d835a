use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Multi-producer inbox drained by swap-then-process.
///
/// Producers on any thread push under a short lock; the owning loop
/// swaps the whole queue out, releases the lock, and processes the
/// batch. Items the loop cannot handle yet go back to the FRONT so the
/// relative order of deferred items is preserved across drains.
pub struct SwapQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> SwapQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().push_back(item);
    }

    /// Take everything currently queued.
    pub fn swap_out(&self) -> VecDeque<T> {
        let mut guard = self.inner.lock();
        std::mem::take(&mut *guard)
    }

    /// Put deferred items back at the front, keeping their order ahead
    /// of anything pushed while the batch was being processed.
    pub fn requeue_front(&self, items: VecDeque<T>) {
        if items.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        for item in items.into_iter().rev() {
            guard.push_front(item);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<T> Clone for SwapQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for SwapQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_takes_everything() {
        let q = SwapQueue::new();
        q.push(1);
        q.push(2);
        let batch = q.swap_out();
        assert_eq!(batch, VecDeque::from(vec![1, 2]));
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_front_preserves_order() {
        let q = SwapQueue::new();
        q.push(1);
        q.push(2);
        let deferred = q.swap_out();
        q.push(3);
        q.requeue_front(deferred);
        assert_eq!(q.swap_out(), VecDeque::from(vec![1, 2, 3]));
    }
}
