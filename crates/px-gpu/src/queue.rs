//! Single-producer single-consumer command ring
//!
//! The command processor appends records at the write cursor and the backend
//! worker consumes them from the read cursor. The ring never wraps: when a
//! record does not fit in the remaining tail, the producer issues a `Sync`,
//! waits for the worker to drain everything, and both cursors restart at 0.

use crate::commands::{BackendCommand, SYNC_RECORD_SIZE};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Ring capacity in bytes
pub const COMMAND_QUEUE_SIZE: usize = 8 * 1024 * 1024;

/// Pending bytes after which a push wakes a sleeping worker
pub const THRESHOLD_TO_WAKE_GPU: usize = 256;

struct CommandQueue {
    storage: Box<[UnsafeCell<u64>]>,
    read_ptr: AtomicUsize,
    write_ptr: AtomicUsize,

    /// Set by the producer, cleared by the worker once it wakes
    wake_requested: Mutex<bool>,
    wake_cv: Condvar,
    sleeping: AtomicBool,

    /// Set by the worker when it reaches a `Sync` record
    sync_done: Mutex<bool>,
    sync_cv: Condvar,

    shutdown: AtomicBool,
}

// SAFETY: the producer only writes bytes at or past `write_ptr` and the
// consumer only reads bytes in `read_ptr..write_ptr`. The cursors are
// published with release/acquire ordering, so the two sides never touch the
// same bytes concurrently. Exactly one handle of each kind exists.
unsafe impl Sync for CommandQueue {}
unsafe impl Send for CommandQueue {}

impl CommandQueue {
    fn base(&self) -> *mut u8 {
        // UnsafeCell<u64> is repr(transparent)
        self.storage.as_ptr() as *mut u8
    }

    fn capacity(&self) -> usize {
        self.storage.len() * 8
    }
}

/// Snapshot of the ring cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursors {
    pub read: usize,
    pub write: usize,
}

/// Create a ring of `capacity` bytes, rounded up to 8
pub fn command_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let words = capacity.div_ceil(8).max(SYNC_RECORD_SIZE / 8 * 2);
    let storage = (0..words).map(|_| UnsafeCell::new(0u64)).collect();
    let queue = Arc::new(CommandQueue {
        storage,
        read_ptr: AtomicUsize::new(0),
        write_ptr: AtomicUsize::new(0),
        wake_requested: Mutex::new(false),
        wake_cv: Condvar::new(),
        sleeping: AtomicBool::new(false),
        sync_done: Mutex::new(false),
        sync_cv: Condvar::new(),
        shutdown: AtomicBool::new(false),
    });

    (
        QueueProducer {
            queue: Arc::clone(&queue),
        },
        QueueConsumer { queue },
    )
}

/// Writing half, owned by the command processor
pub struct QueueProducer {
    queue: Arc<CommandQueue>,
}

impl QueueProducer {
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn cursors(&self) -> QueueCursors {
        QueueCursors {
            read: self.queue.read_ptr.load(Ordering::Acquire),
            write: self.queue.write_ptr.load(Ordering::Acquire),
        }
    }

    /// Bytes written but not yet consumed
    pub fn pending(&self) -> usize {
        let c = self.cursors();
        c.write.saturating_sub(c.read)
    }

    /// Whether a record of `size` bytes fits while leaving room for a `Sync`
    pub fn has_space_for(&self, size: usize) -> bool {
        let write = self.queue.write_ptr.load(Ordering::Acquire);
        size + SYNC_RECORD_SIZE <= self.capacity() - write
    }

    /// Append a record. Returns false without writing when the tail is too
    /// small; the caller must sync and retry.
    pub fn try_push(&mut self, command: &BackendCommand) -> bool {
        let size = command.encoded_size();
        if !self.has_space_for(size) {
            return false;
        }
        self.write_record(command, size);
        true
    }

    /// Append a `Sync` record. Space for it is always reserved.
    pub fn push_sync(&mut self) {
        let command = BackendCommand::Sync;
        self.write_record(&command, command.encoded_size());
    }

    fn write_record(&mut self, command: &BackendCommand, size: usize) {
        let write = self.queue.write_ptr.load(Ordering::Relaxed);
        debug_assert!(write + size <= self.capacity());

        // SAFETY: `write..write + size` is inside the ring and past the
        // published write cursor, so the consumer is not reading it.
        let out = unsafe { std::slice::from_raw_parts_mut(self.queue.base().add(write), size) };
        command.encode(out);
        self.queue.write_ptr.store(write + size, Ordering::Release);
    }

    /// Whether the worker is parked waiting for work
    pub fn is_consumer_sleeping(&self) -> bool {
        self.queue.sleeping.load(Ordering::Acquire)
    }

    pub fn wake_consumer(&self) {
        let mut requested = self.queue.wake_requested.lock();
        *requested = true;
        self.queue.wake_cv.notify_one();
    }

    /// Block until the worker reports it processed a `Sync` record
    pub fn wait_for_sync(&self) {
        let mut done = self.queue.sync_done.lock();
        while !*done && !self.queue.shutdown.load(Ordering::Acquire) {
            self.queue.sync_cv.wait(&mut done);
        }
        *done = false;
    }

    /// Ask the worker to stop and wake it
    pub fn request_shutdown(&self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.wake_consumer();
        let _guard = self.queue.sync_done.lock();
        self.queue.sync_cv.notify_all();
    }
}

/// Reading half, owned by the backend worker
pub struct QueueConsumer {
    queue: Arc<CommandQueue>,
}

impl QueueConsumer {
    pub fn read_offset(&self) -> usize {
        self.queue.read_ptr.load(Ordering::Relaxed)
    }

    pub fn write_offset(&self) -> usize {
        self.queue.write_ptr.load(Ordering::Acquire)
    }

    /// Decode the record at `offset`, which must lie before the write cursor
    pub fn record_at(&self, offset: usize) -> Option<(BackendCommand<'_>, usize)> {
        let write = self.write_offset();
        if offset >= write {
            return None;
        }

        // SAFETY: `offset..write` was published by the producer and is not
        // written again until the cursors are reset by this consumer.
        let bytes = unsafe { std::slice::from_raw_parts(self.queue.base().add(offset), write - offset) };
        BackendCommand::decode(bytes)
    }

    pub fn set_read_offset(&self, offset: usize) {
        self.queue.read_ptr.store(offset, Ordering::Release);
    }

    /// Restart both cursors at 0. Only valid while the producer waits on a
    /// `Sync`.
    pub fn reset_cursors(&self) {
        self.queue.read_ptr.store(0, Ordering::Release);
        self.queue.write_ptr.store(0, Ordering::Release);
    }

    /// Release a producer blocked in `wait_for_sync`
    pub fn signal_sync(&self) {
        let mut done = self.queue.sync_done.lock();
        *done = true;
        self.queue.sync_cv.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.shutdown.load(Ordering::Acquire)
    }

    /// Park until woken. Returns false when shutdown was requested.
    pub fn sleep(&self) -> bool {
        let mut requested = self.queue.wake_requested.lock();
        self.queue.sleeping.store(true, Ordering::Release);
        while !*requested && !self.is_shutdown() {
            self.queue.wake_cv.wait(&mut requested);
        }
        *requested = false;
        self.queue.sleeping.store(false, Ordering::Release);
        !self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{BackendCommand, HEADER_SIZE};

    #[test]
    fn test_push_and_read_back() {
        let (mut producer, consumer) = command_queue(1024);
        assert!(producer.try_push(&BackendCommand::FlushRender));
        assert!(producer.try_push(&BackendCommand::UpdateResolutionScale(2)));
        assert_eq!(producer.pending(), HEADER_SIZE + HEADER_SIZE + 8);

        let (first, size) = consumer.record_at(0).unwrap();
        assert!(matches!(first, BackendCommand::FlushRender));
        let (second, _) = consumer.record_at(size).unwrap();
        assert!(matches!(second, BackendCommand::UpdateResolutionScale(2)));
        assert!(consumer.record_at(producer.cursors().write).is_none());
    }

    #[test]
    fn test_push_reserves_sync_space() {
        let (mut producer, consumer) = command_queue(32);
        assert!(producer.try_push(&BackendCommand::FlushRender));
        assert!(producer.try_push(&BackendCommand::FlushRender));
        assert!(producer.try_push(&BackendCommand::FlushRender));
        // The final 8 bytes stay free for the barrier
        assert!(!producer.try_push(&BackendCommand::FlushRender));
        producer.push_sync();
        assert_eq!(producer.cursors().write, 32);

        let (record, _) = consumer.record_at(24).unwrap();
        assert!(matches!(record, BackendCommand::Sync));
        consumer.reset_cursors();
        assert_eq!(producer.cursors(), QueueCursors { read: 0, write: 0 });
    }

    #[test]
    fn test_shutdown_releases_sleeper() {
        let (producer, consumer) = command_queue(64);
        let handle = std::thread::spawn(move || consumer.sleep());
        while !producer.is_consumer_sleeping() {
            std::thread::yield_now();
        }
        producer.request_shutdown();
        assert!(!handle.join().unwrap());
    }
}
