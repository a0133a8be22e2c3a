//! Single-slot mailbox between the render thread and the streaming worker

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

/// Latest-wins hand-off: holds at most one pending item.
///
/// Writing never waits for the reader. An unread item is replaced by the
/// next write and counted as overwritten. Closing the slot is the
/// cancellation signal: readers return `None` from then on, even if an
/// item is still pending.
pub struct FrameSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct SlotState<T> {
    pending: Option<T>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
    overwritten: AtomicUsize,
}

/// Snapshot of the slot counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub written: usize,
    pub read: usize,
    pub overwritten: usize,
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                closed: false,
            }),
            ready: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the pending item. Returns false once the slot is closed.
    pub fn write(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if state.pending.replace(item).is_some() {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);

        self.stats.written.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        true
    }

    /// Consumer: block until an item is pending or the slot is closed.
    pub fn wait_and_read(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.pending.take() {
                self.stats.read.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Signal cancellation and wake every reader. Any pending item is discarded.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending = None;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            written: self.stats.written.load(Ordering::Relaxed),
            read: self.stats.read.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn latest_write_wins() {
        let slot = FrameSlot::new();
        for i in 0..5 {
            assert!(slot.write(i));
        }
        assert_eq!(slot.wait_and_read(), Some(4));
        assert!(!slot.has_pending());
        assert_eq!(
            slot.stats(),
            SlotStats {
                written: 5,
                read: 1,
                overwritten: 4
            }
        );
    }

    #[test]
    fn reader_is_woken_by_write() {
        let slot = Arc::new(FrameSlot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_and_read())
        };
        thread::sleep(Duration::from_millis(20));
        slot.write(7u32);
        assert_eq!(reader.join().unwrap(), Some(7));
    }

    #[test]
    fn close_wakes_idle_reader() {
        let slot: Arc<FrameSlot<u32>> = Arc::new(FrameSlot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let started = Instant::now();
                (slot.wait_and_read(), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        slot.close();
        let (item, waited) = reader.join().unwrap();
        assert_eq!(item, None);
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn close_discards_pending_item() {
        let slot = FrameSlot::new();
        slot.write("frame");
        slot.close();
        assert_eq!(slot.wait_and_read(), None);
        assert!(!slot.write("late"));
        assert!(slot.is_closed());
    }

    #[test]
    fn writer_never_waits_for_a_busy_reader() {
        let slot = Arc::new(FrameSlot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(i) = slot.wait_and_read() {
                    seen.push(i);
                    thread::sleep(Duration::from_millis(5));
                }
                seen
            })
        };

        let started = Instant::now();
        for i in 0..1000 {
            slot.write(i);
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        thread::sleep(Duration::from_millis(30));
        slot.close();
        let seen = reader.join().unwrap();
        assert!(seen.len() < 1000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
