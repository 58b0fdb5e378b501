// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared global queue: the strict-FIFO backstop behind the local deques.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Strict FIFO queue shared across the node's workers
pub struct GlobalQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Arc<Notify>,
}

impl<T> GlobalQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append an item and wake one waiter
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Take the oldest item, if any
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait until an item may be available
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Current depth
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for GlobalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = GlobalQueue::new();
        q.push("a");
        q.push("b");
        q.push("c");

        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.pop(), Some("c"));
        assert_eq!(q.pop(), None);
    }

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let q = Arc::new(GlobalQueue::new());
        let waiter = q.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            waiter.pop()
        });
        tokio::task::yield_now().await;

        q.push(42);
        assert_eq!(handle.await.unwrap(), Some(42));
    }
}
