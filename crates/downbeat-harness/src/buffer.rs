//! Blocking bounded buffer.
//!
//! `put` blocks while the buffer is full and `take` blocks while it is
//! empty. Both block in a plain condvar wait, which the conductor cannot
//! see into; scenarios built on this buffer exercise the monitor's opaque
//! blocking detection rather than beat waits.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

/// Fixed-capacity FIFO shared between threads.
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Append `item`, blocking while the buffer is full.
    pub fn put(&self, item: T) {
        let mut items = self.lock();
        while items.len() >= self.capacity {
            items = self.not_full.wait(items).unwrap_or_else(PoisonError::into_inner);
        }
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Append `item` if there is room, handing it back otherwise.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the buffer is empty.
    pub fn take(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            items = self.not_empty.wait(items).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove the oldest item if there is one.
    pub fn try_take(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_order() {
        let buffer = BoundedBuffer::new(3);
        buffer.put(1);
        buffer.put(2);
        buffer.put(3);

        assert_eq!(buffer.try_put(4), Err(4));
        assert_eq!(buffer.take(), 1);
        assert_eq!(buffer.take(), 2);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn zero_capacity_holds_one() {
        let buffer = BoundedBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.try_put('a'), Ok(()));
        assert_eq!(buffer.try_put('b'), Err('b'));
    }

    #[test]
    fn try_take_on_empty() {
        let buffer = BoundedBuffer::<u8>::new(1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.try_take(), None);
    }

    #[test]
    fn put_blocks_until_take() {
        let buffer = Arc::new(BoundedBuffer::new(1));
        buffer.put(42);

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.put(17))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.take(), 42);

        producer.join().unwrap();
        assert_eq!(buffer.take(), 17);
        assert!(buffer.is_empty());
    }
}
