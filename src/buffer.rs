use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

/// Ordered queue of byte segments with a cumulative-byte capacity bound and
/// front-rewind for partial writes.
///
/// The send side of a connection uses one of these with a capacity; the recv
/// side uses an unbounded one drained by the higher layer. A notifier can be
/// registered to learn about empty→non-empty transitions (used to wake the
/// worker that drains the queue); it is detached when the connection dies so
/// no further writes get scheduled.
///
/// One producer (any thread, via the pool's enqueue path), one consumer (the
/// owning worker).
pub struct SegBuffer {
    inner: Mutex<Inner>,
    /// Capacity in cumulative bytes, not segment count. 0 = unbounded.
    capacity: AtomicUsize,
    notifier: Mutex<Option<Box<dyn Fn() + Send>>>,
}

struct Inner {
    segs: VecDeque<Bytes>,
    bytes: usize,
}

impl SegBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SegBuffer {
            inner: Mutex::new(Inner {
                segs: VecDeque::new(),
                bytes: 0,
            }),
            capacity: AtomicUsize::new(capacity),
            notifier: Mutex::new(None),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Append a segment. Fails (handing the segment back) if the cumulative
    /// byte total would exceed the capacity bound.
    pub fn push(&self, seg: Bytes) -> Result<(), Bytes> {
        let was_empty;
        {
            let mut inner = self.inner.lock().unwrap();
            let cap = self.capacity.load(Ordering::Relaxed);
            if cap != 0 && inner.bytes + seg.len() > cap {
                return Err(seg);
            }
            was_empty = inner.segs.is_empty();
            inner.bytes += seg.len();
            inner.segs.push_back(seg);
        }
        if was_empty
            && let Some(f) = self.notifier.lock().unwrap().as_ref()
        {
            f();
        }
        Ok(())
    }

    /// Remove and return the next segment. Returns an empty segment when the
    /// queue is empty; consumers use zero length as their loop terminator.
    pub fn move_pop(&self) -> Bytes {
        let mut inner = self.inner.lock().unwrap();
        match inner.segs.pop_front() {
            Some(seg) => {
                inner.bytes -= seg.len();
                seg
            }
            None => Bytes::new(),
        }
    }

    /// Prepend a segment back to the front. Used to restore bytes that could
    /// not be written; exempt from the capacity check since the bytes were
    /// already admitted.
    pub fn rewind(&self, seg: Bytes) {
        if seg.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.bytes += seg.len();
        inner.segs.push_front(seg);
    }

    pub fn len_bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().segs.is_empty()
    }

    /// Attach the empty→non-empty notifier.
    pub fn reg_handler<F: Fn() + Send + 'static>(&self, f: F) {
        *self.notifier.lock().unwrap() = Some(Box::new(f));
    }

    /// Detach any registered notifier.
    pub fn unreg_handler(&self) {
        *self.notifier.lock().unwrap() = None;
    }
}

impl Default for SegBuffer {
    fn default() -> Self {
        Self::new()
    }
}
