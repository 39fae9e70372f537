use std::{error, fmt};

/// Errors surfaced by queue constructors. Steady-state operations never
/// fail; an empty queue reads as "not ready" and overrun is reported through
/// `loss_count`, not as an error.
#[derive(Debug)]
pub enum QueueError {
    /// Requested or adopted capacity is zero or not a power of two.
    InvalidCapacity(u32),
    /// `reserve(n)` called with `n == 0` or `n` larger than the capacity.
    InvalidReservation { requested: u32, capacity: u32 },
    /// Creating, opening or mapping the shared-memory segment failed.
    ShmMapFailure(shared_memory::ShmemError),
    /// An opener waited past the initialization budget without the creator
    /// marking the segment ready.
    ShmInitTimeout,
    /// The segment header records a different element size than the one this
    /// handle was instantiated with.
    ElementSizeMismatch { expected: u32, found: u32 },
    /// Create-or-open found an existing segment with a different capacity.
    CapacityMismatch { requested: u32, found: u32 },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::InvalidCapacity(capacity) => {
                write!(f, "capacity must be a power of 2, got {}", capacity)
            }
            QueueError::InvalidReservation {
                requested,
                capacity,
            } => write!(
                f,
                "reservation of {} slots is invalid for a queue of capacity {}",
                requested, capacity
            ),
            QueueError::ShmMapFailure(e) => write!(f, "shared memory error: {}", e),
            QueueError::ShmInitTimeout => {
                write!(f, "timed out waiting for shared memory initialization")
            }
            QueueError::ElementSizeMismatch { expected, found } => write!(
                f,
                "shared memory element size mismatch: expected {} but got {}",
                expected, found
            ),
            QueueError::CapacityMismatch { requested, found } => write!(
                f,
                "shared memory capacity mismatch: expected {} but got {}",
                requested, found
            ),
        }
    }
}

impl error::Error for QueueError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            QueueError::ShmMapFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for QueueError {
    fn from(err: shared_memory::ShmemError) -> Self {
        QueueError::ShmMapFailure(err)
    }
}
