//! # Single-producer / single-consumer byte ring
//!
//! A fixed-capacity byte queue carrying fixed-size records. One thread (the
//! registered producer) writes; one thread (the drain) reads. Capacity is a
//! power of two and wraparound is masked, so a record may straddle the wrap
//! point and is copied in two segments.
//!
//! ## Publication protocol
//!
//! ```text
//!  producer                                consumer
//!  ────────                                ────────
//!  copy record bytes                       r = read_pos
//!  write_pos.store(Release) ─────────────▶ w = write_pos.load(Acquire)
//!                                          copy record bytes
//!  r = read_pos.load(Acquire) ◀─────────── read_pos CAS (AcqRel)
//!  (observes freed space)
//! ```
//!
//! A producer's payload bytes happen-before any read that observes the
//! matching `write_pos`; a consumer's `read_pos` advance happens-before the
//! producer's observation of the freed space.
//!
//! `read_pos` is only ever advanced by compare-exchange. The drain is the
//! ring's consumer, but during pool exhaustion the producer may drop the
//! oldest record of a ring it has already submitted; the CAS makes the two
//! advances race-safe — whichever loses observes the new position and
//! re-reads.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::domain::CaptureError;

/// Fixed-capacity SPSC byte ring carrying fixed-size records.
pub struct RingBuffer {
    buf: Box<[UnsafeCell<u8>]>,
    capacity: u32,
    mask: u32,
    element_size: u32,
    write_pos: AtomicU32,
    read_pos: AtomicU32,
}

// SAFETY: the byte region is shared between exactly one writer and one
// reader per the SPSC protocol above; all cross-thread access to payload
// bytes is ordered by release/acquire on write_pos and CAS on read_pos.
#[allow(unsafe_code)]
unsafe impl Send for RingBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring of `capacity` bytes carrying `element_size`-byte
    /// records. Capacity must be a power of two and at least twice the
    /// element size.
    pub fn new(capacity: u32, element_size: u32) -> Result<Self, CaptureError> {
        if element_size == 0
            || capacity == 0
            || !capacity.is_power_of_two()
            || capacity < element_size * 2
        {
            return Err(CaptureError::RecordTooLarge {
                record: element_size as usize,
                capacity: capacity as usize,
            });
        }
        let buf = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect::<Vec<_>>();
        Ok(Self {
            buf: buf.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            element_size,
            write_pos: AtomicU32::new(0),
            read_pos: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    fn data_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8.
        self.buf.as_ptr().cast::<UnsafeCell<u8>>() as *mut u8
    }

    fn used_bytes(&self, write: u32, read: u32) -> u32 {
        write.wrapping_sub(read) & self.mask
    }

    /// Records currently buffered.
    #[must_use]
    pub fn len(&self) -> u32 {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        self.used_bytes(w, r) / self.element_size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available to the producer before the ring reports full. One
    /// byte of slack is always reserved so full and empty stay
    /// distinguishable.
    #[must_use]
    pub fn free_bytes(&self) -> u32 {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        self.capacity - 1 - self.used_bytes(w, r)
    }

    /// Producer side: copy one record in and publish it.
    pub fn write(&self, record: &[u8]) -> Result<(), CaptureError> {
        let len = record.len();
        if len == 0 || len >= self.capacity as usize {
            return Err(CaptureError::RecordTooLarge {
                record: len,
                capacity: self.capacity as usize,
            });
        }
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        if self.used_bytes(w, r) as usize + len >= self.capacity as usize {
            return Err(CaptureError::RingFull);
        }

        let pos = w as usize;
        let first = len.min(self.capacity as usize - pos);
        // SAFETY: the region [w, w + len) is unused (checked above) and the
        // producer is the only writer; the consumer will not read it until
        // the Release store below publishes it.
        #[allow(unsafe_code)]
        unsafe {
            ptr::copy_nonoverlapping(record.as_ptr(), self.data_ptr().add(pos), first);
            if first < len {
                ptr::copy_nonoverlapping(record.as_ptr().add(first), self.data_ptr(), len - first);
            }
        }
        self.write_pos
            .store(w.wrapping_add(len as u32) & self.mask, Ordering::Release);
        Ok(())
    }

    /// Consumer side: move up to `max_records` whole records into `out`
    /// (appended) and advance `read_pos`. Returns the number of records
    /// moved.
    ///
    /// If a concurrent `drop_oldest` wins the position race, the copied
    /// bytes are discarded and the read restarts from the new position.
    pub fn read_into(&self, out: &mut Vec<u8>, max_records: u32) -> u32 {
        if max_records == 0 {
            return 0;
        }
        loop {
            let r = self.read_pos.load(Ordering::Acquire);
            let w = self.write_pos.load(Ordering::Acquire);
            let avail = self.used_bytes(w, r) / self.element_size;
            let take = avail.min(max_records);
            if take == 0 {
                return 0;
            }
            let len = (take * self.element_size) as usize;
            let start = out.len();
            self.copy_out(r as usize, len, out);

            let next = r.wrapping_add(len as u32) & self.mask;
            if self
                .read_pos
                .compare_exchange(r, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return take;
            }
            // Lost the race against drop_oldest; the copy may contain a
            // dropped record, so discard and re-read.
            out.truncate(start);
        }
    }

    fn copy_out(&self, pos: usize, len: usize, out: &mut Vec<u8>) {
        let first = len.min(self.capacity as usize - pos);
        // SAFETY: [r, r + len) was published by the producer's Release store
        // on write_pos observed above; the producer will not overwrite it
        // until read_pos advances past it. A racing drop_oldest can
        // invalidate the bytes mid-copy, in which case the CAS in the caller
        // fails and the copy is discarded unread.
        #[allow(unsafe_code)]
        unsafe {
            out.extend_from_slice(std::slice::from_raw_parts(self.data_ptr().add(pos), first));
            if first < len {
                out.extend_from_slice(std::slice::from_raw_parts(self.data_ptr(), len - first));
            }
        }
    }

    /// Advance past the oldest record without reading it. Returns false when
    /// the ring is empty. Safe to call from the producer during exhaustion
    /// even while the drain is mid-read; see the module docs.
    pub fn drop_oldest(&self) -> bool {
        loop {
            let r = self.read_pos.load(Ordering::Acquire);
            let w = self.write_pos.load(Ordering::Acquire);
            if self.used_bytes(w, r) < self.element_size {
                return false;
            }
            let next = r.wrapping_add(self.element_size) & self.mask;
            if self
                .read_pos
                .compare_exchange_weak(r, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Zero both positions. Caller must own the ring exclusively (it is in
    /// neither queue and not active).
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Release);
    }
}
