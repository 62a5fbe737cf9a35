//! Request id generation.

use std::sync::atomic::{AtomicI32, Ordering};

/// Starting value for request IDs
pub(crate) const INITIAL_REQUEST_ID: i32 = 9000;

/// Thread-safe sequence of request ids.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next_id: AtomicI32,
}

impl IdGenerator {
    pub(crate) fn new(start: i32) -> Self {
        Self {
            next_id: AtomicI32::new(start),
        }
    }

    /// Gets the next ID, incrementing the internal counter
    pub(crate) fn next(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(INITIAL_REQUEST_ID)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_id_generator() {
        let ids = IdGenerator::default();
        assert_eq!(ids.next(), INITIAL_REQUEST_ID);
        assert_eq!(ids.next(), INITIAL_REQUEST_ID + 1);

        let ids = IdGenerator::new(100);
        assert_eq!(ids.next(), 100);
    }

    #[test]
    fn test_id_generator_thread_safe() {
        let ids = Arc::new(IdGenerator::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..100).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids: Vec<i32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all_ids.sort();

        assert_eq!(all_ids, (0..1000).collect::<Vec<_>>());
    }
}
