//! Process-shared unnamed semaphore living inside the mapped region.

use std::marker::PhantomData;
use std::ptr::NonNull;

use nix::errno::Errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("semaphore {op} failed: {errno}")]
pub struct SemaphoreError {
    pub op: &'static str,
    pub errno: Errno,
}

/// Whether a failed wait may simply be retried.
fn is_retryable(errno: Errno) -> bool {
    matches!(errno, Errno::EINTR | Errno::EAGAIN)
}

/// Borrowed view of a `sem_t` inside a shared mapping.
///
/// The view is valid as long as the mapping it points into; the owning
/// [`ClaimTable`](super::ClaimTable) ties that lifetime to `'a`.
#[derive(Debug, Clone, Copy)]
pub struct Semaphore<'a> {
    raw: NonNull<libc::sem_t>,
    _region: PhantomData<&'a ()>,
}

impl<'a> Semaphore<'a> {
    /// # Safety
    ///
    /// `raw` must be aligned and point into a live shared mapping that outlives `'a`.
    pub(crate) unsafe fn from_raw(raw: NonNull<libc::sem_t>) -> Self {
        Self {
            raw,
            _region: PhantomData,
        }
    }

    /// Initialize as a process-shared semaphore with the given count.
    pub fn init(&self, value: u32) -> Result<(), SemaphoreError> {
        // SAFETY: pointer validity is guaranteed by from_raw's contract.
        let rc = unsafe { libc::sem_init(self.raw.as_ptr(), 1, value) };
        if rc != 0 {
            return Err(SemaphoreError {
                op: "init",
                errno: Errno::last(),
            });
        }
        Ok(())
    }

    /// Block until the semaphore is acquired. Released when the guard drops.
    pub fn acquire(&self) -> Result<SemaphoreGuard<'a>, SemaphoreError> {
        loop {
            // SAFETY: see from_raw.
            if unsafe { libc::sem_wait(self.raw.as_ptr()) } == 0 {
                return Ok(SemaphoreGuard { sem: *self });
            }
            let errno = Errno::last();
            if !is_retryable(errno) {
                return Err(SemaphoreError { op: "wait", errno });
            }
            tracing::trace!(%errno, "Retrying interrupted semaphore wait");
        }
    }

    fn release(&self) -> Result<(), SemaphoreError> {
        // SAFETY: see from_raw.
        if unsafe { libc::sem_post(self.raw.as_ptr()) } != 0 {
            return Err(SemaphoreError {
                op: "post",
                errno: Errno::last(),
            });
        }
        Ok(())
    }

    /// Destroy the semaphore. A semaphore already destroyed is not an error.
    pub fn destroy(&self) -> Result<(), SemaphoreError> {
        // SAFETY: see from_raw.
        if unsafe { libc::sem_destroy(self.raw.as_ptr()) } == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINVAL => {
                tracing::debug!("Semaphore already destroyed");
                Ok(())
            }
            errno => Err(SemaphoreError {
                op: "destroy",
                errno,
            }),
        }
    }
}

/// Held semaphore. Posting happens on drop, so every exit path releases it.
#[must_use = "the semaphore is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SemaphoreGuard<'a> {
    sem: Semaphore<'a>,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release() {
            tracing::error!(error = %e, "Failed to release semaphore");
        }
    }
}
