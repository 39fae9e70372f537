use std::cell::UnsafeCell;
use std::mem;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{
    cpu_relax, pack_reserved, reserved_index, reserved_size, segment_size, wait_for_segment_ready,
    CacheAligned, ControlSlot, SegmentHeader, SharedSegment, CONTROL_SLOT_SIZE, HEADER_MAGIC,
    HEADER_SIZE, INIT_STATE_INITIALIZING, INIT_STATE_READY, INIT_STATE_UNINITIALIZED,
    INVALID_INDEX, RESERVED_SIZE_BITS,
};
use crate::errors::QueueError;

/// Header fields of a process-local queue. Boxed so the queue object can be
/// moved while the reservation word keeps a stable address, and cache-line
/// aligned so producers hammering `reserved` do not false-share with
/// consumers reading `last_published`.
struct LocalHeader {
    reserved: CacheAligned<AtomicU64>,
    last_published: CacheAligned<AtomicU64>,
}

impl LocalHeader {
    fn new() -> Self {
        LocalHeader {
            reserved: CacheAligned(AtomicU64::new(0)),
            last_published: CacheAligned(AtomicU64::new(INVALID_INDEX)),
        }
    }
}

/// Owns the storage the queue's raw pointers refer to: heap allocations for
/// a local queue, the mapped segment for a shared one.
enum Backing<T> {
    Local {
        _header: Box<LocalHeader>,
        _control: Box<[ControlSlot]>,
        _data: Box<[UnsafeCell<MaybeUninit<T>>]>,
    },
    Shared {
        _segment: SharedSegment,
    },
}

/// A lock-free, bounded, lossy multi-producer/multi-consumer ring buffer.
///
/// Records are treated as trivially copyable blobs of a fixed size, so the
/// element type is bounded by `Copy`. Capacity is a power of two and fixed
/// for the queue's lifetime. See the crate-level documentation for the
/// concurrency model.
pub struct SlickQueue<T> {
    capacity: u32,
    mask: u32,
    data: *mut T,
    control: *const ControlSlot,
    reserved_ptr: *const AtomicU64,
    last_published_ptr: *const AtomicU64,
    #[cfg(any(debug_assertions, feature = "loss-detection"))]
    loss_count: CacheAligned<AtomicU64>,
    own: bool,
    use_shm: bool,
    last_published_valid: bool,
    _backing: Backing<T>,
}

// SAFETY: all cross-thread state is reached through atomics with the
// acquire/release publication handshake; record storage is only dereferenced
// after observing the matching stamp, and T is a plain-old-data type.
unsafe impl<T: Copy + Send> Send for SlickQueue<T> {}
unsafe impl<T: Copy + Send> Sync for SlickQueue<T> {}

impl<T: Copy> SlickQueue<T> {
    /// Builds a process-local queue with heap-owned storage.
    pub fn new(capacity: u32) -> Result<Self, QueueError> {
        validate_capacity(capacity)?;
        assert!(
            mem::align_of::<T>() <= CONTROL_SLOT_SIZE,
            "element alignment must not exceed 16 bytes"
        );

        let header = Box::new(LocalHeader::new());
        let control: Box<[ControlSlot]> = (0..capacity).map(|_| ControlSlot::new()).collect();
        let data: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        let reserved_ptr = &header.reserved.0 as *const AtomicU64;
        let last_published_ptr = &header.last_published.0 as *const AtomicU64;
        let control_ptr = control.as_ptr();
        let data_ptr = data.as_ptr() as *mut UnsafeCell<MaybeUninit<T>> as *mut T;

        Ok(SlickQueue {
            capacity,
            mask: capacity - 1,
            data: data_ptr,
            control: control_ptr,
            reserved_ptr,
            last_published_ptr,
            #[cfg(any(debug_assertions, feature = "loss-detection"))]
            loss_count: CacheAligned(AtomicU64::new(0)),
            own: true,
            use_shm: false,
            last_published_valid: true,
            _backing: Backing::Local {
                _header: header,
                _control: control,
                _data: data,
            },
        })
    }

    /// Creates or opens a shared queue at `name` (a file-link path) with the
    /// expected capacity. Whichever handle wins the in-segment handshake
    /// initializes the storage and unlinks the name on drop; every other
    /// handle binds as an opener and fails on a capacity mismatch.
    pub fn create(capacity: u32, name: &str) -> Result<Self, QueueError> {
        validate_capacity(capacity)?;
        let segment =
            SharedSegment::create_or_open(name, segment_size(capacity, mem::size_of::<T>()))?;
        Self::bind(segment, Some(capacity))
    }

    /// Opens an existing shared queue by name, adopting the capacity
    /// recorded in the segment header.
    pub fn open(name: &str) -> Result<Self, QueueError> {
        let segment = SharedSegment::open(name)?;
        Self::bind(segment, None)
    }

    fn bind(mut segment: SharedSegment, requested: Option<u32>) -> Result<Self, QueueError> {
        assert!(
            mem::align_of::<T>() <= CONTROL_SLOT_SIZE,
            "element alignment must not exceed 16 bytes"
        );
        let base = segment.base();
        // SAFETY: any mapped segment is at least HEADER_SIZE bytes, and the
        // header consists solely of atomics and padding, valid for every bit
        // pattern including fresh zeroes.
        let header = unsafe { &*(base as *const SegmentHeader) };

        let mut own = false;
        let mut last_published_valid = false;

        // Openers by name never write the init-state cell.
        let won_init = requested.is_some()
            && header
                .init_state
                .compare_exchange(
                    INIT_STATE_UNINITIALIZED,
                    INIT_STATE_INITIALIZING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();

        let capacity = if won_init {
            let capacity = requested.unwrap();
            own = true;
            last_published_valid = true;

            header.header_magic.store(HEADER_MAGIC, Ordering::Release);
            header.reserved.store(0, Ordering::Relaxed);
            header.last_published.store(INVALID_INDEX, Ordering::Relaxed);
            header.capacity.store(capacity, Ordering::Relaxed);
            header
                .element_size
                .store(mem::size_of::<T>() as u32, Ordering::Relaxed);

            let control = unsafe { base.add(HEADER_SIZE) } as *const ControlSlot;
            for k in 0..capacity as usize {
                // SAFETY: the segment was sized for `capacity` control slots
                // and zeroed memory is a valid (if not yet meaningful)
                // ControlSlot.
                unsafe { &*control.add(k) }.clear();
            }

            header.init_state.store(INIT_STATE_READY, Ordering::Release);
            capacity
        } else {
            if !wait_for_segment_ready(header) {
                return Err(QueueError::ShmInitTimeout);
            }
            if header.init_state.load(Ordering::Acquire) == INIT_STATE_READY {
                last_published_valid =
                    header.header_magic.load(Ordering::Acquire) == HEADER_MAGIC;
            }

            let found = header.capacity.load(Ordering::Relaxed);
            let found_element_size = header.element_size.load(Ordering::Relaxed);
            if !found.is_power_of_two() {
                return Err(QueueError::InvalidCapacity(found));
            }
            if found_element_size != mem::size_of::<T>() as u32 {
                return Err(QueueError::ElementSizeMismatch {
                    expected: mem::size_of::<T>() as u32,
                    found: found_element_size,
                });
            }
            if let Some(requested) = requested {
                if found != requested {
                    return Err(QueueError::CapacityMismatch { requested, found });
                }
            }
            found
        };

        segment.set_owner(own);

        let control = unsafe { base.add(HEADER_SIZE) } as *const ControlSlot;
        let data =
            unsafe { base.add(HEADER_SIZE + CONTROL_SLOT_SIZE * capacity as usize) } as *mut T;

        Ok(SlickQueue {
            capacity,
            mask: capacity - 1,
            data,
            control,
            reserved_ptr: &header.reserved as *const AtomicU64,
            last_published_ptr: &header.last_published as *const AtomicU64,
            #[cfg(any(debug_assertions, feature = "loss-detection"))]
            loss_count: CacheAligned(AtomicU64::new(0)),
            own,
            use_shm: true,
            last_published_valid,
            _backing: Backing::Shared { _segment: segment },
        })
    }

    /// Queue capacity in elements.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// True iff this handle initialized the underlying storage.
    #[inline]
    pub fn own_buffer(&self) -> bool {
        self.own
    }

    /// True iff the storage lives in a named shared-memory segment.
    #[inline]
    pub fn use_shm(&self) -> bool {
        self.use_shm
    }

    /// Records skipped because a producer lapped this handle's readers.
    /// Accounting is compiled in for debug builds and for the
    /// `loss-detection` feature; otherwise this returns 0. The counter is
    /// per handle, not shared across processes.
    #[cfg(any(debug_assertions, feature = "loss-detection"))]
    pub fn loss_count(&self) -> u64 {
        self.loss_count.0.load(Ordering::Relaxed)
    }

    #[cfg(not(any(debug_assertions, feature = "loss-detection")))]
    pub fn loss_count(&self) -> u64 {
        0
    }

    /// Current write position: the recommended starting cursor for a reader
    /// joining an already-running queue.
    pub fn initial_reading_index(&self) -> u64 {
        reserved_index(self.reserved().load(Ordering::Relaxed))
    }

    /// Claims `n` contiguous virtual indices and returns the first.
    ///
    /// A reservation never straddles the physical end of the buffer: when
    /// the tail is too short the claim starts over at slot 0 and the skipped
    /// tail slots are marked so readers jump across them.
    pub fn reserve(&self, n: u32) -> Result<u64, QueueError> {
        if n == 0 || n > self.capacity {
            return Err(QueueError::InvalidReservation {
                requested: n,
                capacity: self.capacity,
            });
        }
        let reserved = self.reserved();

        if n == 1 {
            let prev = reserved.fetch_add(1 << RESERVED_SIZE_BITS, Ordering::Release);
            let index = reserved_index(prev);
            let prev_size = reserved_size(prev);
            if prev_size != 1 {
                // Normalize the packed size back to 1. Failure is harmless:
                // another producer advanced the word and will do likewise.
                let _ = reserved.compare_exchange(
                    pack_reserved(index + 1, prev_size),
                    pack_reserved(index + 1, 1),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
            return Ok(index);
        }

        let mut current = reserved.load(Ordering::Relaxed);
        loop {
            let mut index = reserved_index(current);
            let offset = index & u64::from(self.mask);
            let wrapped = offset + u64::from(n) > u64::from(self.capacity);
            if wrapped {
                // Not enough room before the physical end; start over at
                // slot 0.
                index += u64::from(self.capacity) - offset;
            }
            let next = pack_reserved(index + u64::from(n), n);
            match reserved.compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    if wrapped {
                        // Stamp the abandoned tail slot with the new index so
                        // a reader parked there jumps forward. This is a
                        // marker, not a publication: it carries no data and
                        // never touches last_published.
                        let slot = self.control(reserved_index(current) & u64::from(self.mask));
                        slot.size.store(n, Ordering::Relaxed);
                        slot.data_index.store(index, Ordering::Release);
                    }
                    return Ok(index);
                }
                Err(actual) => {
                    current = actual;
                    cpu_relax();
                }
            }
        }
    }

    /// Pointer to the data slot for `index`. Between `reserve` and `publish`
    /// the reserving producer has exclusive use of its claimed range;
    /// writing through the pointer at any other time races with readers.
    #[inline]
    pub fn at(&self, index: u64) -> *mut T {
        // SAFETY: index is masked into the data array bounds.
        unsafe { self.data.add((index & u64::from(self.mask)) as usize) }
    }

    /// Makes `n` records starting at `index` visible to readers.
    pub fn publish(&self, index: u64, n: u32) {
        debug_assert!(n > 0);
        let slot = self.control(index & u64::from(self.mask));
        slot.size.store(n, Ordering::Relaxed);
        slot.data_index.store(index, Ordering::Release);

        if self.last_published_valid {
            let last_published = self.last_published();
            let mut current = last_published.load(Ordering::Relaxed);
            while current == INVALID_INDEX || current < index {
                match last_published.compare_exchange_weak(
                    current,
                    index,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Reads the record at the private cursor, advancing the cursor past it.
    ///
    /// Returns `None` when nothing has been published at the cursor yet. The
    /// returned pointer refers to `size` consecutive elements and is only a
    /// snapshot: a producer lapping the ring may overwrite it at any time.
    /// If the producer already lapped this cursor the skipped records are
    /// added to `loss_count` and the newest record on the slot is returned.
    pub fn read(&self, cursor: &mut u64) -> Option<(*const T, u32)> {
        let (index, size) = loop {
            let slot_offset = *cursor & u64::from(self.mask);
            let slot = self.control(slot_offset);
            let index = slot.data_index.load(Ordering::Acquire);

            if index != INVALID_INDEX
                && reserved_index(self.reserved().load(Ordering::Relaxed)) < index
            {
                // The queue was reset behind this cursor.
                *cursor = 0;
                continue;
            }

            #[cfg(any(debug_assertions, feature = "loss-detection"))]
            if index != INVALID_INDEX
                && index > *cursor
                && index & u64::from(self.mask) == slot_offset
            {
                self.loss_count
                    .0
                    .fetch_add(index - *cursor, Ordering::Relaxed);
            }

            if index == INVALID_INDEX || index < *cursor {
                // Data not ready yet.
                return None;
            }
            if index > *cursor && index & u64::from(self.mask) != slot_offset {
                // The producer wrapped past an unused tail; jump to where it
                // resumed. Nothing was overwritten, so nothing is accounted.
                *cursor = index;
                continue;
            }

            break (index, slot.size.load(Ordering::Relaxed));
        };

        let data = self.at(*cursor) as *const T;
        *cursor = index + u64::from(size);
        Some((data, size))
    }

    /// Reads through a cursor shared by several consumers. The CAS that
    /// advances the cursor hands each record to exactly one of them; readers
    /// that lose the race retry on the next record.
    pub fn read_shared(&self, cursor: &AtomicU64) -> Option<(*const T, u32)> {
        loop {
            let current = cursor.load(Ordering::Relaxed);
            let slot_offset = current & u64::from(self.mask);
            let slot = self.control(slot_offset);
            let index = slot.data_index.load(Ordering::Acquire);

            if index != INVALID_INDEX
                && reserved_index(self.reserved().load(Ordering::Relaxed)) < index
            {
                cursor.store(0, Ordering::Relaxed);
                continue;
            }

            if index == INVALID_INDEX || index < current {
                return None;
            }

            #[cfg(any(debug_assertions, feature = "loss-detection"))]
            let overrun = if index > current && index & u64::from(self.mask) == slot_offset {
                index - current
            } else {
                0
            };

            if index > current && index & u64::from(self.mask) != slot_offset {
                let _ = cursor.compare_exchange_weak(
                    current,
                    index,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                continue;
            }

            let size = slot.size.load(Ordering::Relaxed);
            let next = index + u64::from(size);
            if cursor
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // Loss is attributed to whichever reader claimed the record.
                #[cfg(any(debug_assertions, feature = "loss-detection"))]
                if overrun != 0 {
                    self.loss_count.0.fetch_add(overrun, Ordering::Relaxed);
                }
                return Some((self.at(current) as *const T, size));
            }
            cpu_relax();
        }
    }

    /// Snapshot of the most recently published record, or `None` on a queue
    /// that has never published. The slot may be overwritten concurrently;
    /// the result is best effort.
    ///
    /// On segments written before the header magic existed the last record
    /// is derived from the packed reservation word instead.
    pub fn read_last(&self) -> Option<(*const T, u32)> {
        if self.last_published_valid {
            let last = self.last_published().load(Ordering::Acquire);
            if last == INVALID_INDEX {
                return None;
            }
            let slot = self.control(last & u64::from(self.mask));
            return Some((self.at(last) as *const T, slot.size.load(Ordering::Relaxed)));
        }

        let reserved = self.reserved().load(Ordering::Relaxed);
        let index = reserved_index(reserved);
        if index == 0 {
            return None;
        }
        let size = reserved_size(reserved);
        let last = index.wrapping_sub(u64::from(size));
        Some((self.at(last) as *const T, size))
    }

    /// Reinitializes the queue, invalidating all published data.
    ///
    /// Not safe to run concurrently with producers; the exclusive borrow
    /// enforces that within a process. Readers in other processes observe
    /// the reset through `reserved` falling behind a stamped slot and rewind
    /// their cursors to 0, though a reader racing the reset itself may see a
    /// partially re-initialized queue.
    pub fn reset(&mut self) {
        for k in 0..u64::from(self.capacity) {
            self.control(k).clear();
        }
        self.reserved().store(0, Ordering::Release);
        self.last_published().store(INVALID_INDEX, Ordering::Relaxed);
        #[cfg(any(debug_assertions, feature = "loss-detection"))]
        self.loss_count.0.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn reserved(&self) -> &AtomicU64 {
        // SAFETY: points into the boxed local header or the mapped segment,
        // both owned by `_backing` for the queue's lifetime.
        unsafe { &*self.reserved_ptr }
    }

    #[inline]
    fn last_published(&self) -> &AtomicU64 {
        // SAFETY: as for `reserved`.
        unsafe { &*self.last_published_ptr }
    }

    #[inline]
    fn control(&self, slot_offset: u64) -> &ControlSlot {
        debug_assert!(slot_offset <= u64::from(self.mask));
        // SAFETY: slot_offset is masked into the control array bounds.
        unsafe { &*self.control.add(slot_offset as usize) }
    }
}

fn validate_capacity(capacity: u32) -> Result<(), QueueError> {
    if !capacity.is_power_of_two() {
        return Err(QueueError::InvalidCapacity(capacity));
    }
    Ok(())
}
