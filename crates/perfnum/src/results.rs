//! Fixed-capacity buffer of found values, kept by the pipe and socket coordinators.

/// Capacity of the coordinator-side result buffer.
pub const COORDINATOR_RESULT_SLOTS: usize = 5;

/// The buffer has no empty slot left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("result buffer full ({capacity} slots), dropped {value}")]
pub struct ResultsFull {
    pub capacity: usize,
    pub value: u32,
}

/// Append-only, fixed-capacity list of found values. Never resized.
#[derive(Debug, Clone)]
pub struct ResultBuffer<const N: usize = COORDINATOR_RESULT_SLOTS> {
    values: [u32; N],
    len: usize,
}

impl<const N: usize> Default for ResultBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ResultBuffer<N> {
    pub fn new() -> Self {
        Self {
            values: [0; N],
            len: 0,
        }
    }

    /// Append a value. A value already present is accepted without being stored twice.
    pub fn push(&mut self, value: u32) -> Result<(), ResultsFull> {
        if self.as_slice().contains(&value) {
            return Ok(());
        }
        if self.len == N {
            return Err(ResultsFull { capacity: N, value });
        }
        self.values[self.len] = value;
        self.len += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.values[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}
