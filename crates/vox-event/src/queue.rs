//! Byte-Ring Command Queue
//!
//! Variable-size records travel from control threads to the audio thread
//! through one pre-allocated byte buffer.
//!
//! ## Record layout
//!
//! ```text
//! ┌──────────────┬─────────────┬─────┬─────┬────────────────────┬─────────┐
//! │ total: u32   │ payload: u16│ tag │  0  │ payload bytes ...  │ padding │
//! └──────────────┴─────────────┴─────┴─────┴────────────────────┴─────────┘
//!   total = align4(8 + payload)
//! ```
//!
//! ## Protocol
//!
//! - Writers go through three phases: `reserve` (serialized by a mutex,
//!   bumps the in-flight counter before publishing the new write cursor),
//!   fill the payload, then `commit` (drops the in-flight counter).
//! - A record that does not fit before the end of the buffer is placed at
//!   the start; a `WRAP_TAG` header marks the skipped tail when it has room
//!   for one, a shorter tail is skipped implicitly.
//! - The reader snapshots the write cursor and only drains when no writer
//!   is in flight, so a torn record is never dispatched. Otherwise it
//!   retries on the next tick.
//! - `write == read` means empty; writers never fill the ring completely.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use vox_core::{VoxError, VoxResult};

/// Size of the per-record header
pub const RECORD_HEADER_SIZE: usize = 8;

/// Record alignment
pub const RECORD_ALIGN: usize = 4;

/// Tag of the marker that sends the reader back to offset 0
pub const WRAP_TAG: u8 = 0xFF;

#[inline]
fn align_up(n: usize) -> usize {
    (n + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED RING
// ═══════════════════════════════════════════════════════════════════════════════

struct RingInner {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    in_flight: AtomicUsize,
    writer_lock: Mutex<()>,
    rejected: AtomicU64,
}

// SAFETY: bytes are only written inside a span owned by exactly one
// reservation, and only read after that span is committed and published.
unsafe impl Sync for RingInner {}
unsafe impl Send for RingInner {}

impl RingInner {
    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// Write raw bytes at `offset`.
    ///
    /// # Safety
    /// Caller must own `[offset, offset + bytes.len())` exclusively.
    unsafe fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity);
        // SAFETY: range is in bounds and owned by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().add(offset), bytes.len());
        }
    }

    /// # Safety
    /// `[offset, offset + len)` must be committed and not yet released.
    unsafe fn read_slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: committed bytes are immutable until the reader advances.
        unsafe { std::slice::from_raw_parts(self.base().add(offset), len) }
    }

    unsafe fn write_header(&self, offset: usize, total: usize, payload_len: usize, tag: u8) {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&(total as u32).to_le_bytes());
        header[4..6].copy_from_slice(&(payload_len as u16).to_le_bytes());
        header[6] = tag;
        // SAFETY: forwarded from caller.
        unsafe { self.write_bytes(offset, &header) };
    }

    /// Find room for `total` bytes.
    ///
    /// Returns `(start, new_write, wrap_marker_at)`.
    fn place(&self, write: usize, read: usize, total: usize) -> Option<(usize, usize, Option<usize>)> {
        let cap = self.capacity;
        if write >= read {
            let tail = cap - write;
            if total < tail || (total == tail && read != 0) {
                return Some((write, (write + total) % cap, None));
            }
            // Wrap: the front region must stay strictly short of the reader.
            if total < read {
                return Some((0, total, Some(write)));
            }
            None
        } else if total < read - write {
            Some((write, write + total, None))
        } else {
            None
        }
    }
}

/// Create a command ring of at least `capacity_bytes`
///
/// Returns a cloneable writer for control threads and the single reader
/// for the audio thread.
pub fn command_ring(capacity_bytes: usize) -> (CommandWriter, CommandReader) {
    let capacity = align_up(capacity_bytes.max(RECORD_HEADER_SIZE * 4));
    let buffer = (0..capacity)
        .map(|_| UnsafeCell::new(0u8))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let inner = Arc::new(RingInner {
        buffer,
        capacity,
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        in_flight: AtomicUsize::new(0),
        writer_lock: Mutex::new(()),
        rejected: AtomicU64::new(0),
    });

    (
        CommandWriter {
            inner: Arc::clone(&inner),
        },
        CommandReader {
            inner,
            cursor: 0,
            limit: 0,
            current: None,
        },
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// WRITER (control threads)
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer side; clone freely across control threads
#[derive(Clone)]
pub struct CommandWriter {
    inner: Arc<RingInner>,
}

impl CommandWriter {
    /// Reserve a span for a record with `payload_len` bytes.
    ///
    /// Fails with `InsufficientMemory` when the ring is full; the caller
    /// drops the command.
    pub fn reserve(&self, tag: u8, payload_len: usize) -> VoxResult<WriteReservation<'_>> {
        if payload_len > u16::MAX as usize {
            return Err(VoxError::InsufficientMemory("command record too large"));
        }
        let total = align_up(RECORD_HEADER_SIZE + payload_len);
        let inner = &*self.inner;

        let _guard = inner.writer_lock.lock();
        let read = inner.read_pos.load(Ordering::Acquire);
        let write = inner.write_pos.load(Ordering::Relaxed);

        let Some((start, new_write, wrap_at)) = inner.place(write, read, total) else {
            let rejected = inner.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("CommandWriter: ring full, {} byte record dropped ({} total)", total, rejected);
            return Err(VoxError::InsufficientMemory("command ring full"));
        };

        // Count the writer before the span becomes visible to the reader.
        inner.in_flight.fetch_add(1, Ordering::SeqCst);

        // SAFETY: [start, start + total) and the wrap tail lie between the
        // published write cursor and the reader; nobody else touches them.
        unsafe {
            if let Some(at) = wrap_at {
                if inner.capacity - at >= RECORD_HEADER_SIZE {
                    inner.write_header(at, inner.capacity - at, 0, WRAP_TAG);
                }
            }
            inner.write_header(start, total, payload_len, tag);
        }

        inner.write_pos.store(new_write, Ordering::SeqCst);

        Ok(WriteReservation {
            inner,
            payload_start: start + RECORD_HEADER_SIZE,
            payload_len,
            committed: false,
        })
    }

    /// Reserve, copy and commit in one call
    pub fn post(&self, tag: u8, payload: &[u8]) -> VoxResult<()> {
        let mut span = self.reserve(tag, payload.len())?;
        span.payload_mut().copy_from_slice(payload);
        span.commit();
        Ok(())
    }

    /// Records refused because the ring was full
    pub fn rejected_count(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// A reserved, not yet committed record
///
/// Dropping it without `commit` still releases the in-flight count; the
/// record then carries whatever bytes were written.
pub struct WriteReservation<'a> {
    inner: &'a RingInner,
    payload_start: usize,
    payload_len: usize,
    committed: bool,
}

impl WriteReservation<'_> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: the payload span belongs to this reservation until commit.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.inner.base().add(self.payload_start),
                self.payload_len,
            )
        }
    }

    pub fn commit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.committed {
            self.committed = true;
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for WriteReservation<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// READER (audio thread only)
// ═══════════════════════════════════════════════════════════════════════════════

/// A committed record, borrowed until [`CommandReader::advance`]
#[derive(Debug)]
pub struct RecordView<'a> {
    pub tag: u8,
    pub payload: &'a [u8],
}

/// Consumer side; exactly one exists per ring
pub struct CommandReader {
    inner: Arc<RingInner>,
    cursor: usize,
    limit: usize,
    /// `(start, total)` of the record returned by the last `peek`
    current: Option<(usize, usize)>,
}

impl CommandReader {
    /// Snapshot the write cursor for this drain pass.
    ///
    /// Returns `false` while any writer is in flight; nothing may be read
    /// this tick.
    pub fn begin(&mut self) -> bool {
        let write = self.inner.write_pos.load(Ordering::SeqCst);
        if self.inner.in_flight.load(Ordering::SeqCst) != 0 {
            self.limit = self.cursor;
            return false;
        }
        self.limit = write;
        true
    }

    /// Peek the next record without consuming it
    pub fn peek(&mut self) -> Option<RecordView<'_>> {
        let cap = self.inner.capacity;
        loop {
            if self.cursor == self.limit {
                self.current = None;
                return None;
            }
            if cap - self.cursor < RECORD_HEADER_SIZE {
                self.cursor = 0;
                continue;
            }

            // SAFETY: cursor != limit, so a committed header lives here.
            let header = unsafe { self.inner.read_slice(self.cursor, RECORD_HEADER_SIZE) };
            let total = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let payload_len = u16::from_le_bytes([header[4], header[5]]) as usize;
            let tag = header[6];

            if tag == WRAP_TAG {
                self.cursor = 0;
                continue;
            }

            debug_assert!(total >= RECORD_HEADER_SIZE && self.cursor + total <= cap);
            self.current = Some((self.cursor, total));
            // SAFETY: the payload is part of the same committed record.
            let payload = unsafe {
                self.inner
                    .read_slice(self.cursor + RECORD_HEADER_SIZE, payload_len)
            };
            return Some(RecordView { tag, payload });
        }
    }

    /// Release the record returned by the last `peek`
    pub fn advance(&mut self) {
        if let Some((start, total)) = self.current.take() {
            let next = start + total;
            self.cursor = if next == self.inner.capacity { 0 } else { next };
            self.inner.read_pos.store(self.cursor, Ordering::Release);
        }
    }

    /// Drain every committed record, returning how many were dispatched
    pub fn drain(&mut self, mut f: impl FnMut(u8, &[u8])) -> usize {
        if !self.begin() {
            log::trace!("CommandReader: writer in flight, drain deferred");
            return 0;
        }
        let mut count = 0;
        while let Some(view) = self.peek() {
            f(view.tag, view.payload);
            self.advance();
            count += 1;
        }
        count
    }

    /// Check whether any published data remains (committed or not)
    pub fn is_empty(&self) -> bool {
        self.inner.write_pos.load(Ordering::Acquire) == self.cursor
    }

    /// Writers currently between reserve and commit
    pub fn writers_in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Records the writers could not fit
    pub fn rejected_count(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
