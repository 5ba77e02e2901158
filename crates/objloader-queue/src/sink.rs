use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

/// Fire-and-forget destination for values produced by a loader stage.
pub trait Queue<T>: Send + Sync {
    fn add(&self, value: T);
}

impl<T: Send> Queue<T> for mpsc::UnboundedSender<T> {
    fn add(&self, value: T) {
        if self.send(value).is_err() {
            debug!("queue receiver dropped, value discarded");
        }
    }
}

/// Adapts a closure into a [`Queue`].
pub struct FnQueue<F>(pub F);

impl<T, F> Queue<T> for FnQueue<F>
where
    F: Fn(T) + Send + Sync,
{
    fn add(&self, value: T) {
        (self.0)(value)
    }
}

/// Collects everything added to it.
#[derive(Debug)]
pub struct BufferQueue<T> {
    values: Mutex<Vec<T>>,
}

impl<T> BufferQueue<T> {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.values.lock().expect("lock poisoned"))
    }
}

impl<T> Default for BufferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for BufferQueue<T> {
    fn add(&self, value: T) {
        self.values.lock().expect("lock poisoned").push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn buffer_queue_collects() {
        let q = BufferQueue::new();
        q.add(1);
        q.add(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.take_all(), vec![1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn fn_queue_forwards() {
        let seen = AtomicUsize::new(0);
        let q = FnQueue(|v: usize| {
            seen.fetch_add(v, Ordering::SeqCst);
        });
        q.add(3);
        q.add(4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn unbounded_sender_is_a_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let q: &dyn Queue<u8> = &tx;
        q.add(5);
        assert_eq!(rx.try_recv().unwrap(), 5);
        drop(rx);
        q.add(6);
    }
}
