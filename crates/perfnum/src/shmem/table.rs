use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use serde::Serialize;

use super::layout::{FREE_PID, RESULT_SLOTS, RegionLayout, WORKER_SLOTS, WorkerRecord};
use super::semaphore::Semaphore;
use super::ShmemError;
use crate::results::ResultsFull;

/// A mapping of the shared claim region.
///
/// Each process (and each test thread that wants its own view) holds one
/// `ClaimTable`. Dropping it unmaps the region; [`ClaimTable::destroy`] also
/// removes the named object.
#[derive(Debug)]
pub struct ClaimTable {
    name: String,
    base: NonNull<c_void>,
    layout: RegionLayout,
}

// SAFETY: shared fields are only touched through atomics or under the region's
// semaphores, and the mapping stays valid until Drop.
unsafe impl Send for ClaimTable {}
unsafe impl Sync for ClaimTable {}

/// Registry entry as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub pid: i32,
    pub tested: u32,
    pub found: u32,
}

impl ClaimTable {
    /// Create a fresh region for `[1, limit]`, replacing any stale one.
    pub fn initialize(name: &str, limit: u32) -> Result<Self, ShmemError> {
        if limit == 0 {
            return Err(ShmemError::InvalidLimit);
        }
        match shm_unlink(name) {
            Ok(()) => tracing::info!(name, "Removed stale shared memory object"),
            Err(Errno::ENOENT) => {}
            Err(e) => return Err(ShmemError::resource("unlink", name, e)),
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmemError::resource("create", name, e))?;
        let file = File::from(fd);

        let layout = RegionLayout::for_limit(limit);
        file.set_len(layout.total_size as u64)
            .map_err(|e| ShmemError::resource("size", name, e))?;

        let table = Self::map(name, &file, layout)?;
        table.owner_cell().store(std::process::id() as i32, Ordering::SeqCst);
        for byte in table.bitmap() {
            byte.store(0, Ordering::Relaxed);
        }
        for slot in table.result_slots() {
            slot.store(0, Ordering::Relaxed);
        }
        for record in table.workers() {
            record.pid.store(FREE_PID, Ordering::Relaxed);
            record.tested.store(0, Ordering::Relaxed);
            record.found.store(0, Ordering::Relaxed);
        }
        table.bitmap_sem().init(1)?;
        table.results_sem().init(1)?;
        // Attach treats a zero limit as "not ready", so publish it last.
        table.limit_cell().store(limit, Ordering::SeqCst);

        tracing::info!(name, limit, size = layout.total_size, "Initialized claim table");
        Ok(table)
    }

    /// Map an existing region, recomputing its layout from the stored limit.
    pub fn attach(name: &str) -> Result<Self, ShmemError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ShmemError::resource("open", name, e))?;
        let mut file = File::from(fd);

        let actual = file
            .metadata()
            .map_err(|e| ShmemError::resource("stat", name, e))?
            .len() as usize;
        if actual < size_of::<u32>() {
            return Err(ShmemError::Truncated {
                name: name.to_owned(),
                actual,
            });
        }

        let mut header = [0u8; size_of::<u32>()];
        file.read_exact(&mut header)
            .map_err(|e| ShmemError::resource("read", name, e))?;
        let limit = u32::from_ne_bytes(header);

        let layout = RegionLayout::for_limit(limit);
        if limit == 0 || layout.total_size != actual {
            return Err(ShmemError::LayoutMismatch {
                name: name.to_owned(),
                limit,
                expected: layout.total_size,
                actual,
            });
        }

        tracing::debug!(name, limit, "Attached to claim table");
        Self::map(name, &file, layout)
    }

    fn map(name: &str, file: &File, layout: RegionLayout) -> Result<Self, ShmemError> {
        let len = NonZeroUsize::new(layout.total_size).ok_or(ShmemError::InvalidLimit)?;
        // SAFETY: a new shared mapping; nothing else in this process aliases it yet.
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }
        .map_err(|e| ShmemError::resource("map", name, e))?;

        Ok(Self {
            name: name.to_owned(),
            base,
            layout,
        })
    }

    /// Remove a named region without mapping it.
    pub fn unlink(name: &str) -> Result<(), ShmemError> {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(ShmemError::resource("unlink", name, e)),
        }
    }

    /// Tear down the semaphores and remove the named object.
    pub fn destroy(self) -> Result<(), ShmemError> {
        for sem in [self.bitmap_sem(), self.results_sem()] {
            if let Err(e) = sem.destroy() {
                tracing::warn!(name = %self.name, error = %e, "Failed to destroy semaphore");
            }
        }
        Self::unlink(&self.name)?;
        tracing::info!(name = %self.name, "Removed claim table");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn limit(&self) -> u32 {
        self.layout.limit
    }

    /// Pid of the process that created the region.
    pub fn owner_pid(&self) -> i32 {
        self.owner_cell().load(Ordering::SeqCst)
    }

    fn field<T>(&self, offset: usize) -> NonNull<T> {
        // SAFETY: every offset comes from `layout` and lies inside the mapping.
        unsafe { self.base.cast::<u8>().add(offset).cast::<T>() }
    }

    fn limit_cell(&self) -> &AtomicU32 {
        // SAFETY: aligned, in bounds, lives as long as the mapping.
        unsafe { self.field::<AtomicU32>(self.layout.limit_offset).as_ref() }
    }

    fn owner_cell(&self) -> &AtomicI32 {
        // SAFETY: as above.
        unsafe { self.field::<AtomicI32>(self.layout.owner_pid_offset).as_ref() }
    }

    fn bitmap_sem(&self) -> Semaphore<'_> {
        // SAFETY: as above.
        unsafe { Semaphore::from_raw(self.field(self.layout.bitmap_sem_offset)) }
    }

    fn results_sem(&self) -> Semaphore<'_> {
        // SAFETY: as above.
        unsafe { Semaphore::from_raw(self.field(self.layout.results_sem_offset)) }
    }

    /// Claim bitmap. Bit `k` of byte `i` stands for the integer `8 * i + k + 1`.
    pub fn bitmap(&self) -> &[AtomicU8] {
        let ptr = self.field::<AtomicU8>(self.layout.bitmap_offset);
        // SAFETY: bitmap_len bytes reserved at bitmap_offset.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.layout.bitmap_len) }
    }

    fn result_slots(&self) -> &[AtomicU32] {
        let ptr = self.field::<AtomicU32>(self.layout.results_offset);
        // SAFETY: RESULT_SLOTS words reserved at results_offset.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), RESULT_SLOTS) }
    }

    pub fn workers(&self) -> &[WorkerRecord] {
        let ptr = self.field::<WorkerRecord>(self.layout.workers_offset);
        // SAFETY: WORKER_SLOTS records reserved at workers_offset.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), WORKER_SLOTS) }
    }

    /// Claim the lowest unclaimed integer, or `None` once all of `[1, limit]` is taken.
    ///
    /// The scan runs without the lock; the chosen bit is re-checked and set
    /// under the bitmap semaphore, and the scan resumes if another process won it.
    pub fn claim_next(&self) -> Result<Option<u32>, ShmemError> {
        let bitmap = self.bitmap();
        let limit = self.layout.limit as usize;
        let mut from = 0;

        loop {
            let Some((byte, bit)) = first_clear_bit(bitmap, from) else {
                return Ok(None);
            };
            let candidate = byte * 8 + bit as usize + 1;
            if candidate > limit {
                return Ok(None);
            }

            let _held = self.bitmap_sem().acquire()?;
            let mask = 1u8 << bit;
            if bitmap[byte].fetch_or(mask, Ordering::AcqRel) & mask == 0 {
                return Ok(Some(candidate as u32));
            }
            from = byte;
        }
    }

    /// Number of integers claimed so far.
    pub fn claimed_count(&self) -> u32 {
        self.bitmap()
            .iter()
            .map(|b| b.load(Ordering::Relaxed).count_ones())
            .sum()
    }

    /// Store a found value in the first empty result slot.
    ///
    /// A value already present is accepted and not stored twice.
    pub fn report_result(&self, value: u32) -> Result<(), ShmemError> {
        let _held = self.results_sem().acquire()?;
        let slots = self.result_slots();
        if slots.iter().any(|s| s.load(Ordering::Acquire) == value) {
            return Ok(());
        }
        match slots.iter().find(|s| s.load(Ordering::Acquire) == 0) {
            Some(slot) => {
                slot.store(value, Ordering::Release);
                Ok(())
            }
            None => Err(ResultsFull {
                capacity: RESULT_SLOTS,
                value,
            }
            .into()),
        }
    }

    /// Found values in slot order.
    pub fn results(&self) -> Vec<u32> {
        self.result_slots()
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&v| v != 0)
            .collect()
    }

    pub fn register_self(&self) -> Result<Registration<'_>, ShmemError> {
        self.register(std::process::id() as i32)
    }

    /// Take a free registry slot for `pid`.
    pub fn register(&self, pid: i32) -> Result<Registration<'_>, ShmemError> {
        for (slot, record) in self.workers().iter().enumerate() {
            if record
                .pid
                .compare_exchange(FREE_PID, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                record.tested.store(0, Ordering::Relaxed);
                record.found.store(0, Ordering::Relaxed);
                tracing::debug!(pid, slot, "Registered worker");
                return Ok(Registration { record, slot, pid });
            }
        }
        Err(ShmemError::RegistryFull(WORKER_SLOTS))
    }

    /// Currently registered workers.
    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers()
            .iter()
            .filter_map(|r| {
                let pid = r.pid.load(Ordering::Acquire);
                (pid != FREE_PID).then(|| WorkerSnapshot {
                    pid,
                    tested: r.tested.load(Ordering::Relaxed),
                    found: r.found.load(Ordering::Relaxed),
                })
            })
            .collect()
    }
}

impl Drop for ClaimTable {
    fn drop(&mut self) {
        // SAFETY: base/len are exactly what mmap returned; no borrows outlive self.
        if let Err(e) = unsafe { munmap(self.base, self.layout.total_size) } {
            tracing::warn!(name = %self.name, error = %e, "munmap failed");
        }
    }
}

/// Position of the first zero bit at or after byte `from`.
fn first_clear_bit(bitmap: &[AtomicU8], from: usize) -> Option<(usize, u32)> {
    bitmap
        .iter()
        .enumerate()
        .skip(from)
        .find_map(|(i, b)| {
            let bits = b.load(Ordering::Acquire);
            (bits != u8::MAX).then(|| (i, bits.trailing_ones()))
        })
}

/// A worker's registry slot. Freed on drop.
#[derive(Debug)]
pub struct Registration<'a> {
    record: &'a WorkerRecord,
    slot: usize,
    pid: i32,
}

impl Registration<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn record_tested(&self) {
        self.record.tested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_found(&self) {
        self.record.found.fetch_add(1, Ordering::Relaxed);
    }

    /// Free the slot now instead of at drop.
    ///
    /// Returns false if the slot no longer belonged to this pid, in which case
    /// it is left untouched.
    pub fn unregister_self(self) -> bool {
        let freed = self.release();
        std::mem::forget(self);
        freed
    }

    fn release(&self) -> bool {
        let freed = self
            .record
            .pid
            .compare_exchange(self.pid, FREE_PID, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if freed {
            tracing::debug!(pid = self.pid, slot = self.slot, "Unregistered worker");
        } else {
            tracing::warn!(pid = self.pid, slot = self.slot, "Registry slot taken over, not freed");
        }
        freed
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
