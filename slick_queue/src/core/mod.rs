use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::QueueError;

/// Sentinel for "no index": never-published slots and an empty
/// `last_published` pointer.
pub(crate) const INVALID_INDEX: u64 = u64::MAX;

/// 'SLQ1', stamped at offset 24 by whichever handle initializes a segment.
pub(crate) const HEADER_MAGIC: u32 = 0x534C_5131;

pub(crate) const HEADER_SIZE: usize = 64;
pub(crate) const CONTROL_SLOT_SIZE: usize = 16;

pub(crate) const INIT_STATE_UNINITIALIZED: u32 = 0;
pub(crate) const INIT_STATE_LEGACY: u32 = 1;
pub(crate) const INIT_STATE_INITIALIZING: u32 = 2;
pub(crate) const INIT_STATE_READY: u32 = 3;

const MAX_INIT_WAIT_MS: u32 = 2000;
const LEGACY_GRACE_MS: u32 = 5;

/// The reservation cursor packs a 48-bit virtual index over a 16-bit record
/// of the most recent reservation's size. The size half only feeds the
/// legacy `read_last` path on segments that predate the header magic.
pub(crate) const RESERVED_SIZE_BITS: u32 = 16;
const RESERVED_INDEX_MASK: u64 = 0xFFFF_FFFF_FFFF;
const RESERVED_SIZE_MASK: u64 = 0xFFFF;

#[inline]
pub(crate) const fn pack_reserved(index: u64, size: u32) -> u64 {
    ((index & RESERVED_INDEX_MASK) << RESERVED_SIZE_BITS) | (size as u64 & RESERVED_SIZE_MASK)
}

#[inline]
pub(crate) const fn reserved_index(reserved: u64) -> u64 {
    reserved >> RESERVED_SIZE_BITS
}

#[inline]
pub(crate) const fn reserved_size(reserved: u64) -> u32 {
    (reserved & RESERVED_SIZE_MASK) as u32
}

/// Fixed 64-byte segment header. The field offsets are a cross-process ABI:
/// producer and consumer builds must agree on them byte for byte, so the
/// layout is pinned with `repr(C)` and explicit padding.
///
/// `capacity` and `element_size` are plain metadata written once before the
/// ready handshake; they are atomics only because the legacy grace path
/// reads them while a pre-magic writer may still be filling them in.
#[repr(C)]
pub(crate) struct SegmentHeader {
    pub reserved: AtomicU64,        // offset 0
    pub capacity: AtomicU32,        // offset 8
    pub element_size: AtomicU32,    // offset 12
    pub last_published: AtomicU64,  // offset 16
    pub header_magic: AtomicU32,    // offset 24
    _pad0: [u8; 20],                // offset 28, reserved for future use
    pub init_state: AtomicU32,      // offset 48
    _pad1: [u8; 12],                // offset 52, reserved for future use
}

const _: () = assert!(mem::size_of::<SegmentHeader>() == HEADER_SIZE);

/// Per-slot control word. `data_index == INVALID_INDEX` means never
/// published; otherwise it holds the virtual index the occupant was
/// published at and `size` the run length of that reservation.
#[repr(C)]
pub(crate) struct ControlSlot {
    pub data_index: AtomicU64,
    pub size: AtomicU32,
    _pad: u32,
}

const _: () = assert!(mem::size_of::<ControlSlot>() == CONTROL_SLOT_SIZE);

impl ControlSlot {
    pub(crate) fn new() -> Self {
        ControlSlot {
            data_index: AtomicU64::new(INVALID_INDEX),
            size: AtomicU32::new(1),
            _pad: 0,
        }
    }

    /// Marks the slot empty, as freshly initialized storage would be.
    #[inline]
    pub(crate) fn clear(&self) {
        self.size.store(1, Ordering::Relaxed);
        self.data_index.store(INVALID_INDEX, Ordering::Relaxed);
    }
}

/// Total segment size for a queue of `capacity` elements of `element_size`
/// bytes: header, control array, data array.
pub(crate) fn segment_size(capacity: u32, element_size: usize) -> usize {
    HEADER_SIZE + (CONTROL_SLOT_SIZE + element_size) * capacity as usize
}

/// Aligns a field to its own cache line so producer and consumer counters
/// do not false-share.
#[repr(align(64))]
pub(crate) struct CacheAligned<T>(pub T);

#[inline]
pub(crate) fn cpu_relax() {
    #[cfg(feature = "cpu-relax")]
    std::hint::spin_loop();
}

/// A mapped named segment. Creation races between processes resolve in two
/// steps: the file link layer (`LinkExists` falls back to opening), then the
/// in-segment `init_state` CAS decides which handle actually initializes.
pub(crate) struct SharedSegment {
    shmem: Shmem,
}

impl SharedSegment {
    pub(crate) fn create_or_open(path: &str, size: usize) -> Result<Self, QueueError> {
        let shmem = match ShmemConf::new().size(size).flink(path).create() {
            Ok(m) => m,
            Err(ShmemError::LinkExists) => ShmemConf::new().flink(path).open()?,
            Err(e) => return Err(QueueError::ShmMapFailure(e)),
        };
        Ok(SharedSegment { shmem })
    }

    pub(crate) fn open(path: &str) -> Result<Self, QueueError> {
        let shmem = ShmemConf::new().flink(path).open()?;
        Ok(SharedSegment { shmem })
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Whether dropping this handle unlinks the segment name. Set to true on
    /// the handle that wins the initialization handshake, false on every
    /// opener.
    pub(crate) fn set_owner(&mut self, own: bool) {
        self.shmem.set_owner(own);
    }
}

/// Polls `init_state` until the creator marks the segment ready.
///
/// Segments written by producers that predate the header magic never reach
/// `READY`; those advertise `LEGACY`, which is accepted after a short grace
/// window once the metadata fields are non-zero. A zero capacity during the
/// grace window counts as "not ready" and keeps the poll going.
pub(crate) fn wait_for_segment_ready(header: &SegmentHeader) -> bool {
    for elapsed_ms in 0..MAX_INIT_WAIT_MS {
        let state = header.init_state.load(Ordering::Acquire);
        if state == INIT_STATE_READY {
            return true;
        }

        if state == INIT_STATE_LEGACY && elapsed_ms >= LEGACY_GRACE_MS {
            let capacity = header.capacity.load(Ordering::Relaxed);
            let element_size = header.element_size.load(Ordering::Relaxed);
            if capacity != 0 && element_size != 0 {
                return true;
            }
        }

        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Segment settings for binaries that load their parameters from a TOML
/// file. The queue name maps to a file link at `data_dir/queue_file_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub data_dir: String,
    pub queue_file_name: String,
    pub capacity: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            data_dir: String::from("."),
            queue_file_name: String::from("slick-queue.ipc"),
            capacity: 1024,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder {
            config: QueueConfig::default(),
        }
    }

    /// Path of the file link backing the named segment.
    pub fn segment_path(&self) -> String {
        format!("{}/{}", self.data_dir, self.queue_file_name)
    }
}

pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.config.data_dir = data_dir.into();
        self
    }

    pub fn queue_file_name(mut self, queue_file_name: impl Into<String>) -> Self {
        self.config.queue_file_name = queue_file_name.into();
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn build(self) -> Result<QueueConfig, QueueError> {
        if !self.config.capacity.is_power_of_two() {
            return Err(QueueError::InvalidCapacity(self.config.capacity));
        }
        Ok(self.config)
    }
}
