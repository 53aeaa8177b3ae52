//! Hand-off buffer between callbacks and the reconciliation loop.

use tokio::sync::Mutex;

/// A buffer that producers push into and a single consumer drains.
///
/// `drain` swaps the contents out under the lock, so every pushed item is
/// delivered by exactly one drain.
#[derive(Debug)]
pub struct DrainQueue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for DrainQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> DrainQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, item: T) {
        self.items.lock().await.push(item);
    }

    /// Returns everything queued so far and leaves the queue empty.
    pub async fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().await)
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}
