//! Byte layout of the shared claim region.
//!
//! Field order is fixed: limit, owner pid, bitmap semaphore, claim bitmap,
//! results semaphore, result slots, worker registry. Each field starts at its
//! natural alignment. The layout is a pure function of `limit`, so any process
//! that reads the stored limit recomputes exactly the same offsets and size.

use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicI32, AtomicU32};

/// Result slots in shared memory.
pub const RESULT_SLOTS: usize = 20;

/// Worker registry slots in shared memory.
pub const WORKER_SLOTS: usize = 20;

/// Pid value marking a free registry slot.
pub const FREE_PID: i32 = -1;

/// One registry entry, updated in place by its owning worker.
#[repr(C)]
#[derive(Debug)]
pub struct WorkerRecord {
    pub pid: AtomicI32,
    pub tested: AtomicU32,
    pub found: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub limit: u32,
    pub limit_offset: usize,
    pub owner_pid_offset: usize,
    pub bitmap_sem_offset: usize,
    pub bitmap_offset: usize,
    pub bitmap_len: usize,
    pub results_sem_offset: usize,
    pub results_offset: usize,
    pub workers_offset: usize,
    pub total_size: usize,
}

/// Reserve `size` bytes at the next `align`-aligned offset.
fn place(cursor: &mut usize, align: usize, size: usize) -> usize {
    let offset = cursor.next_multiple_of(align);
    *cursor = offset + size;
    offset
}

fn place_of<T>(cursor: &mut usize, count: usize) -> usize {
    place(cursor, align_of::<T>(), size_of::<T>() * count)
}

impl RegionLayout {
    pub fn for_limit(limit: u32) -> Self {
        let bitmap_len = (limit as usize).div_ceil(8);
        let mut cursor = 0;

        let limit_offset = place_of::<AtomicU32>(&mut cursor, 1);
        let owner_pid_offset = place_of::<AtomicI32>(&mut cursor, 1);
        let bitmap_sem_offset = place_of::<libc::sem_t>(&mut cursor, 1);
        let bitmap_offset = place(&mut cursor, 1, bitmap_len);
        let results_sem_offset = place_of::<libc::sem_t>(&mut cursor, 1);
        let results_offset = place_of::<AtomicU32>(&mut cursor, RESULT_SLOTS);
        let workers_offset = place_of::<WorkerRecord>(&mut cursor, WORKER_SLOTS);

        Self {
            limit,
            limit_offset,
            owner_pid_offset,
            bitmap_sem_offset,
            bitmap_offset,
            bitmap_len,
            results_sem_offset,
            results_offset,
            workers_offset,
            total_size: cursor,
        }
    }
}
