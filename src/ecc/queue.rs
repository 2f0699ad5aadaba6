//! A bounded hand-off queue between one producer and many consumers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// What a consumer gets out of [WorkQueue::wait]
#[derive(Debug, Eq, PartialEq)]
pub enum Work<T> {
    Item(T),

    /// The queue was finished and every posted item has been handed out
    Closed,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// Bounded, thread-safe work queue.
///
/// [post](Self::post) blocks once `capacity` items are waiting, which keeps a fast producer from
/// running arbitrarily far ahead of its consumers.
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` (at least 1) waiting items
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                finished: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand an item to the consumers, waiting for room if the queue is full.
    ///
    /// Once the queue is finished, nothing more is accepted and the item is given back.
    pub fn post(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        loop {
            if state.finished {
                return Err(item);
            }
            if state.items.len() < self.capacity {
                break;
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Wait for the next item.
    ///
    /// Items posted before [finish](Self::finish) are still handed out; after that, every call
    /// returns [Work::Closed].
    pub fn wait(&self) -> Work<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Work::Item(item);
            }
            if state.finished {
                return Work::Closed;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting items and wake everybody up. Calling this more than once is harmless.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }
}

#[test]
fn test_fifo_then_closed() {
    let queue = WorkQueue::new(4);
    queue.post(1).unwrap();
    queue.post(2).unwrap();
    queue.post(3).unwrap();
    queue.finish();

    assert_eq!(queue.wait(), Work::Item(1));
    assert_eq!(queue.wait(), Work::Item(2));
    assert_eq!(queue.wait(), Work::Item(3));
    assert_eq!(queue.wait(), Work::Closed);
    assert_eq!(queue.wait(), Work::Closed);
}

#[test]
fn test_finish_is_idempotent() {
    let queue = WorkQueue::new(1);
    queue.post("a").unwrap();
    queue.finish();
    queue.finish();

    assert!(queue.is_finished());
    assert_eq!(queue.post("b"), Err("b"));
    assert_eq!(queue.wait(), Work::Item("a"));
    assert_eq!(queue.wait(), Work::Closed);
}

#[test]
fn test_backpressure_and_many_consumers() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const ITEMS: usize = 1000;

    let queue = WorkQueue::new(2);
    let received = AtomicUsize::new(0);
    let sum = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while let Work::Item(value) = queue.wait() {
                    received.fetch_add(1, Ordering::Relaxed);
                    sum.fetch_add(value, Ordering::Relaxed);
                }
            });
        }

        for value in 0..ITEMS {
            queue.post(value).unwrap();
        }
        queue.finish();
    });

    assert_eq!(received.into_inner(), ITEMS);
    assert_eq!(sum.into_inner(), (0..ITEMS).sum::<usize>());
}

#[test]
fn test_finish_wakes_blocked_consumers() {
    use std::thread;
    use std::time::Duration;

    let queue = WorkQueue::<u32>::new(1);

    thread::scope(|scope| {
        let waiters: Vec<_> = (0..3).map(|_| scope.spawn(|| queue.wait())).collect();

        thread::sleep(Duration::from_millis(20));
        queue.finish();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Work::Closed);
        }
    });
}
