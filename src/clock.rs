//! Vector clocks for causal ordering of protocol events.

use core::fmt;

use crate::messages::ProcessId;

/// A received clock vector had the wrong length — a protocol version or
/// cluster size mismatch. The message carrying it must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionMismatch {
    pub expected: usize,
    pub got: usize,
}

impl fmt::Display for DimensionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vector clock dimension mismatch: expected {}, got {}",
            self.expected, self.got
        )
    }
}

impl core::error::Error for DimensionMismatch {}

/// Per-process vector clock.
///
/// One component per process in the cluster. Every component is monotone
/// non-decreasing; the owner's component strictly increases on every local
/// event and on every merge with a received clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClock {
    clock: Vec<u64>,
    owner: ProcessId,
}

impl VectorClock {
    /// Create a zeroed clock for `owner` in a cluster of `num_processes`.
    #[must_use]
    pub fn new(num_processes: usize, owner: ProcessId) -> Self {
        Self {
            clock: vec![0; num_processes],
            owner,
        }
    }

    /// Record a local event: bump the owner's component.
    pub fn increment(&mut self) {
        self.clock[self.owner as usize] += 1;
    }

    /// Merge a received clock: element-wise max, then increment.
    ///
    /// The increment after the max makes the local "received this message"
    /// event causally after both the local history and the sender's.
    ///
    /// # Errors
    ///
    /// [`DimensionMismatch`] if `remote` is not the cluster size. The local
    /// clock is untouched in that case.
    pub fn merge(&mut self, remote: &[u64]) -> Result<(), DimensionMismatch> {
        if remote.len() != self.clock.len() {
            return Err(DimensionMismatch {
                expected: self.clock.len(),
                got: remote.len(),
            });
        }
        for (local, remote) in self.clock.iter_mut().zip(remote) {
            *local = (*local).max(*remote);
        }
        self.increment();
        Ok(())
    }

    /// An owned copy of the current state, safe to embed in an outbound
    /// message.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u64> {
        self.clock.clone()
    }

    #[must_use]
    pub fn owner(&self) -> ProcessId {
        self.owner
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {}: {:?}", self.owner, self.clock)
    }
}
