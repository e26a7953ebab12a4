use parking_lot::{Condvar, Mutex};

const MAX_READERS: u32 = u32::MAX;

#[derive(Default)]
struct LatchState {
    reader_count: u32,
    writer_entered: bool,
}

/// Reader-writer latch with writer preference, built over a mutex and two
/// condition variables. A writer that has entered blocks new readers, then
/// waits for active readers to drain; readers and writers never coexist.
///
/// Unlike a guard-based lock, acquisition and release are separate calls so
/// that latch ownership can cross function boundaries (latch crabbing).
pub struct RwLatch {
    state: Mutex<LatchState>,
    readers: Condvar,
    writer: Condvar,
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            readers: Condvar::new(),
            writer: Condvar::new(),
        }
    }

    /// Acquire the latch in shared mode. Blocks while a writer has entered
    /// or the reader count is saturated.
    pub fn read_lock(&self) {
        let mut state = self.state.lock();
        while state.writer_entered || state.reader_count == MAX_READERS {
            self.readers.wait(&mut state);
        }
        state.reader_count += 1;
    }

    /// Release a shared acquisition.
    pub fn read_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.reader_count > 0, "read_unlock without read_lock");
        state.reader_count -= 1;
        if state.writer_entered {
            if state.reader_count == 0 {
                self.writer.notify_one();
            }
        } else if state.reader_count == MAX_READERS - 1 {
            self.readers.notify_one();
        }
    }

    /// Acquire the latch in exclusive mode. Marks the writer as entered
    /// first (shutting out new readers), then drains active readers.
    pub fn write_lock(&self) {
        let mut state = self.state.lock();
        while state.writer_entered {
            self.readers.wait(&mut state);
        }
        state.writer_entered = true;
        while state.reader_count > 0 {
            self.writer.wait(&mut state);
        }
    }

    /// Release an exclusive acquisition and wake all readers.
    pub fn write_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer_entered, "write_unlock without write_lock");
        state.writer_entered = false;
        self.readers.notify_all();
    }

    /// Mode-parameterized acquire, for callers that carry an `exclusive` flag.
    pub fn lock(&self, exclusive: bool) {
        if exclusive {
            self.write_lock();
        } else {
            self.read_lock();
        }
    }

    /// Mode-parameterized release.
    pub fn unlock(&self, exclusive: bool) {
        if exclusive {
            self.write_unlock();
        } else {
            self.read_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let latch = Arc::new(RwLatch::new());
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = latch.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(thread::spawn(move || {
                latch.read_lock();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                latch.read_unlock();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "readers never overlapped");
    }

    #[test]
    fn test_writer_excludes_readers() {
        let latch = Arc::new(RwLatch::new());
        let counter = Arc::new(AtomicU32::new(0));

        latch.write_lock();
        let reader = {
            let latch = latch.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                latch.read_lock();
                counter.store(1, Ordering::SeqCst);
                latch.read_unlock();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        latch.write_unlock();
        reader.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writers_serialize() {
        let latch = Arc::new(RwLatch::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    latch.write_lock();
                    let v = counter.load(Ordering::SeqCst);
                    counter.store(v + 1, Ordering::SeqCst);
                    latch.write_unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 400);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let latch = Arc::new(RwLatch::new());

        latch.read_lock();
        let writer = {
            let latch = latch.clone();
            thread::spawn(move || {
                latch.write_lock();
                latch.write_unlock();
            })
        };
        // Give the writer time to enter and raise the gate.
        thread::sleep(Duration::from_millis(50));

        let late_reader_done = Arc::new(AtomicU32::new(0));
        let late_reader = {
            let latch = latch.clone();
            let done = late_reader_done.clone();
            thread::spawn(move || {
                latch.read_lock();
                done.store(1, Ordering::SeqCst);
                latch.read_unlock();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            late_reader_done.load(Ordering::SeqCst),
            0,
            "reader slipped past a waiting writer"
        );

        latch.read_unlock();
        writer.join().unwrap();
        late_reader.join().unwrap();
        assert_eq!(late_reader_done.load(Ordering::SeqCst), 1);
    }
}
