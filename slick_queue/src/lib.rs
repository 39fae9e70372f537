//! A lock-free, bounded, lossy multi-producer/multi-consumer ring buffer
//! whose storage is either process-local or a named shared-memory segment,
//! so that independent processes can exchange fixed-size records.
//!
//! # Overview
//! Producers reserve a contiguous range of slots, write records in place and
//! publish them. Consumers poll with a cursor of their own (or share one
//! atomic cursor for work-stealing) and read whatever has been published.
//! The queue never blocks and never exerts back-pressure: when producers
//! outrun consumers, older records are silently overwritten and consumers
//! skip forward, optionally accounting for the number of records lost.
//!
//! Key components:
//! - [`SlickQueue`](crate::queue::SlickQueue): the queue itself, generic
//!   over a trivially copyable element type.
//! - [`QueueConfig`](crate::core::QueueConfig): file-backed segment settings
//!   for binaries that load their parameters from a TOML file. Use
//!   [`QueueConfig::builder()`](crate::core::QueueConfig::builder) to
//!   construct.
//! - [`QueueError`](crate::errors::QueueError): constructor-time error type.
//!   Once a queue is built, reserve/publish/read never fail.
//!
//! # Concurrency Model and Safety
//!
//! All synchronization happens through atomics in the queue header and in a
//! per-slot control word; there are no locks and no system calls on the hot
//! paths.
//!
//! - **Reservation (`reserve`):** producers claim virtual indices from a
//!   single packed atomic word. The claim is an atomic RMW, so for a given
//!   virtual index exactly one producer owns the slot range until it
//!   publishes.
//! - **Publication (`publish`):** a Release store of the virtual index into
//!   the slot's control word. A consumer that observes the stamp with an
//!   Acquire load also observes every write the producer made to the record
//!   beforehand.
//! - **Reads are lossy and may be torn at the edges:** `read` returns a raw
//!   pointer into the buffer, not a reference, because a fast producer may
//!   lap the ring and overwrite the record while the consumer is still
//!   looking at it. Consumers that need the payload beyond the next queue
//!   operation must copy it out promptly. A consumer that falls more than
//!   one full lap behind will miss records; this is by contract, not a
//!   failure mode.
//! - **Private vs. shared cursors:** each private cursor is an independent
//!   subscription and may miss a different subset of records. A shared
//!   atomic cursor hands every record to at most one of the readers that
//!   poll it.
//!
//! **User responsibilities:**
//! - Write to a reserved slot only between `reserve` and `publish`, and only
//!   through the pointer returned by [`SlickQueue::at`].
//! - Treat pointers returned by the read methods as snapshots: copy the
//!   record out before doing anything slow.
//! - Call [`SlickQueue::reset`] only while no producer is mid-publish;
//!   concurrent readers recover through the reset predicate but may observe
//!   a partially re-initialized queue while the reset is in flight.

pub mod core;
pub mod errors;
pub mod queue;

pub use crate::core::QueueConfig;
pub use crate::errors::QueueError;
pub use crate::queue::SlickQueue;

#[cfg(test)]
mod tests;
