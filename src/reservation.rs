//! Memory accounting for population batches
//!
//! A `MemoryTracker` hands out `TrackedReservation`s; several reservations
//! can be bundled in an `AggregatedReservation` and released together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{IndexError, Result};

/// Memory held until `release` is called
pub trait MemoryReservation: Send {
    fn bytes(&self) -> usize;

    fn release(&mut self) -> Result<()>;
}

/// Running total of reserved bytes plus the high-water mark
#[derive(Debug, Default)]
pub struct MemoryTracker {
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reserve(self: &Arc<Self>, bytes: usize) -> TrackedReservation {
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(used, Ordering::AcqRel);
        TrackedReservation {
            tracker: Arc::clone(self),
            bytes,
            released: false,
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

pub struct TrackedReservation {
    tracker: Arc<MemoryTracker>,
    bytes: usize,
    released: bool,
}

impl MemoryReservation for TrackedReservation {
    fn bytes(&self) -> usize {
        self.bytes
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(IndexError::illegal_state("reservation already released"));
        }
        self.released = true;
        self.tracker.used.fetch_sub(self.bytes, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for TrackedReservation {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.tracker.used.fetch_sub(self.bytes, Ordering::AcqRel);
        }
    }
}

/// Bundle of reservations released as one.
///
/// `release` releases every part even when some fail and returns the
/// first error as it was raised.
#[derive(Default)]
pub struct AggregatedReservation {
    parts: Vec<Box<dyn MemoryReservation>>,
}

impl AggregatedReservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reservation: Box<dyn MemoryReservation>) {
        self.parts.push(reservation);
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl MemoryReservation for AggregatedReservation {
    fn bytes(&self) -> usize {
        self.parts.iter().map(|p| p.bytes()).sum()
    }

    fn release(&mut self) -> Result<()> {
        let mut first_error = None;
        for mut part in self.parts.drain(..) {
            if let Err(e) = part.release() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
