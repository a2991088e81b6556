//! Sequence Allocator
//!
//! Hands out small integer sequence numbers from a bounded range. Used for
//! the interface part of addresses and for delegated subnet numbers.
//!
//! ## Design
//!
//! - Allocation is monotonic: the cursor advances past every value handed
//!   out, so a freed value is not reused until the range wraps
//! - Values still in use are skipped when the cursor wraps around
//! - The range is half-open: `first..limit`

use std::collections::HashSet;
use thiserror::Error;

/// Errors related to sequence allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("no available values in {first}..{limit}")]
    Exhausted { first: u64, limit: u64 },

    #[error("value {0} not allocated")]
    NotFound(u64),

    #[error("value {0} already in use")]
    AlreadyInUse(u64),

    #[error("value {0} outside the allocator range")]
    OutOfRange(u64),
}

/// Monotonic allocator over a bounded integer range.
#[derive(Debug)]
pub struct SequenceAllocator {
    /// Set of currently allocated values.
    in_use: HashSet<u64>,
    /// Next candidate value.
    next: u64,
    /// Lowest value handed out.
    first: u64,
    /// One past the highest value handed out.
    limit: u64,
}

impl SequenceAllocator {
    /// Create an allocator over `first..limit`.
    pub fn new(first: u64, limit: u64) -> Self {
        Self {
            in_use: HashSet::new(),
            next: first,
            first,
            limit: limit.max(first),
        }
    }

    /// Number of values the range can hold.
    pub fn capacity(&self) -> u64 {
        self.limit - self.first
    }

    /// Allocate the next free value.
    ///
    /// Starts at the cursor and skips values still in use, wrapping at the
    /// end of the range. Fails only when every value is taken.
    pub fn allocate(&mut self) -> Result<u64, IndexError> {
        for _ in 0..self.capacity() {
            let candidate = self.next;
            self.next += 1;
            if self.next >= self.limit {
                self.next = self.first;
            }
            if self.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }

        Err(IndexError::Exhausted {
            first: self.first,
            limit: self.limit,
        })
    }

    /// Free a value, returning it to the pool.
    pub fn free(&mut self, value: u64) -> Result<(), IndexError> {
        if self.in_use.remove(&value) {
            Ok(())
        } else {
            Err(IndexError::NotFound(value))
        }
    }

    /// Check if a value is currently allocated.
    pub fn is_allocated(&self, value: u64) -> bool {
        self.in_use.contains(&value)
    }

    /// Number of currently allocated values.
    pub fn count(&self) -> usize {
        self.in_use.len()
    }

    /// Check if nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }

    /// Reserve a specific value.
    pub fn reserve(&mut self, value: u64) -> Result<(), IndexError> {
        if value < self.first || value >= self.limit {
            return Err(IndexError::OutOfRange(value));
        }
        if self.in_use.insert(value) {
            Ok(())
        } else {
            Err(IndexError::AlreadyInUse(value))
        }
    }
}
