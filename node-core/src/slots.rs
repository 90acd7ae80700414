// Boot slot abstraction - the persisted partition table owned by the bootloader
//
// The firmware implements these traits over esp_ota_*; MemorySlots keeps the
// same bookkeeping in RAM so the engine and the boot-health logic run on a host.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Bootloader view of the running image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    New,
    PendingVerify,
    Valid,
    Invalid,
    Aborted,
    Undefined,
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("no update partition available")]
    NoPartition,
    #[error("image of {size} bytes does not fit partition of {capacity} bytes")]
    TooLarge { size: u32, capacity: u32 },
    #[error("image rejected by bootloader validation")]
    Rejected,
    #[error("no previous image to roll back to")]
    NoRollbackTarget,
    #[error("{op} failed (code {code:#x})")]
    Backend { op: &'static str, code: i32 },
}

/// Write session against the inactive partition.
pub trait ImageWriter {
    fn label(&self) -> &str;

    fn capacity(&self) -> u32;

    fn write(&mut self, chunk: &[u8]) -> Result<(), SlotError>;

    /// Finalize the image and select it as the next boot target.
    fn complete(self) -> Result<(), SlotError>;

    /// Drop the session; the partition is never selected for boot.
    fn abort(self) -> Result<(), SlotError>;
}

pub trait BootSlots: Send {
    type Writer: ImageWriter;

    /// Resolve the inactive partition and open a session sized for the image.
    fn begin_update(&mut self, image_size: u32) -> Result<Self::Writer, SlotError>;

    fn running_image_state(&self) -> Result<ImageState, SlotError>;

    /// Confirm the running image and cancel any pending rollback.
    fn mark_running_valid(&mut self) -> Result<(), SlotError>;

    /// Mark the running image invalid, select the previous one and restart.
    /// Returns only if that was not possible.
    fn rollback_and_restart(&mut self) -> Result<Infallible, SlotError>;

    fn restart(&mut self) -> !;
}

/// Panic payload used by [`MemorySlots`] in place of a device restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequested {
    pub rollback: bool,
}

/// Bookkeeping of the simulated flash.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    pub capacity: u32,
    pub has_update_partition: bool,
    pub has_previous_image: bool,
    pub running_state: ImageState,
    pub reject_images: bool,
    pub fail_boot_switch: bool,
    /// Every flash write fails.
    pub fail_write: bool,
    /// Contents of the update partition after the last completed session.
    pub image: Vec<u8>,
    pub boot_target_updated: bool,
    pub sessions: u32,
    pub finalized: u32,
    pub aborted: u32,
    pub marked_valid: u32,
    pub rollbacks: u32,
    pub restarts: u32,
}

impl MemoryFlash {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            has_update_partition: true,
            has_previous_image: true,
            running_state: ImageState::PendingVerify,
            reject_images: false,
            fail_boot_switch: false,
            fail_write: false,
            image: Vec::new(),
            boot_target_updated: false,
            sessions: 0,
            finalized: 0,
            aborted: 0,
            marked_valid: 0,
            rollbacks: 0,
            restarts: 0,
        }
    }
}

/// RAM-backed boot slots. Clones share the same flash.
///
/// `restart` and a successful `rollback_and_restart` unwind the calling thread
/// with a [`RestartRequested`] payload.
#[derive(Debug, Clone)]
pub struct MemorySlots {
    flash: Arc<Mutex<MemoryFlash>>,
}

impl MemorySlots {
    pub fn new(capacity: u32) -> Self {
        Self {
            flash: Arc::new(Mutex::new(MemoryFlash::new(capacity))),
        }
    }

    pub fn configure(&self, f: impl FnOnce(&mut MemoryFlash)) {
        f(&mut self.lock());
    }

    pub fn snapshot(&self) -> MemoryFlash {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFlash> {
        self.flash.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BootSlots for MemorySlots {
    type Writer = MemoryWriter;

    fn begin_update(&mut self, image_size: u32) -> Result<MemoryWriter, SlotError> {
        let mut flash = self.lock();
        if !flash.has_update_partition {
            return Err(SlotError::NoPartition);
        }
        if image_size > flash.capacity {
            return Err(SlotError::TooLarge {
                size: image_size,
                capacity: flash.capacity,
            });
        }
        flash.sessions += 1;

        Ok(MemoryWriter {
            flash: Arc::clone(&self.flash),
            capacity: flash.capacity,
            staged: Vec::with_capacity(image_size as usize),
            open: true,
        })
    }

    fn running_image_state(&self) -> Result<ImageState, SlotError> {
        Ok(self.lock().running_state)
    }

    fn mark_running_valid(&mut self) -> Result<(), SlotError> {
        let mut flash = self.lock();
        flash.marked_valid += 1;
        flash.running_state = ImageState::Valid;
        Ok(())
    }

    fn rollback_and_restart(&mut self) -> Result<Infallible, SlotError> {
        {
            let mut flash = self.lock();
            if !flash.has_previous_image {
                return Err(SlotError::NoRollbackTarget);
            }
            flash.rollbacks += 1;
            flash.running_state = ImageState::Invalid;
        }
        std::panic::panic_any(RestartRequested { rollback: true })
    }

    fn restart(&mut self) -> ! {
        self.lock().restarts += 1;
        std::panic::panic_any(RestartRequested { rollback: false })
    }
}

pub struct MemoryWriter {
    flash: Arc<Mutex<MemoryFlash>>,
    capacity: u32,
    staged: Vec<u8>,
    open: bool,
}

impl MemoryWriter {
    fn finish(&mut self) -> MutexGuard<'_, MemoryFlash> {
        self.open = false;
        self.flash.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImageWriter for MemoryWriter {
    fn label(&self) -> &str {
        "ota_1"
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SlotError> {
        let failing = self
            .flash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_write;
        if failing || self.staged.len() + chunk.len() > self.capacity as usize {
            return Err(SlotError::Backend {
                op: "write",
                code: -1,
            });
        }
        self.staged.extend_from_slice(chunk);
        Ok(())
    }

    fn complete(mut self) -> Result<(), SlotError> {
        let staged = std::mem::take(&mut self.staged);
        let mut flash = self.finish();
        if flash.reject_images {
            flash.aborted += 1;
            return Err(SlotError::Rejected);
        }
        if flash.fail_boot_switch {
            return Err(SlotError::Backend {
                op: "set_boot_partition",
                code: -1,
            });
        }
        flash.image = staged;
        flash.finalized += 1;
        flash.boot_target_updated = true;
        Ok(())
    }

    fn abort(mut self) -> Result<(), SlotError> {
        self.finish().aborted += 1;
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        // Session dropped without complete/abort
        if self.open {
            self.finish().aborted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_session_updates_boot_target() {
        let mut slots = MemorySlots::new(16);
        let mut writer = slots.begin_update(4).unwrap();
        writer.write(b"ab").unwrap();
        writer.write(b"cd").unwrap();
        writer.complete().unwrap();

        let flash = slots.snapshot();
        assert_eq!(flash.image, b"abcd");
        assert!(flash.boot_target_updated);
        assert_eq!(flash.aborted, 0);
    }

    #[test]
    fn test_dropped_session_counts_as_aborted() {
        let mut slots = MemorySlots::new(16);
        drop(slots.begin_update(4).unwrap());

        let flash = slots.snapshot();
        assert_eq!(flash.aborted, 1);
        assert!(!flash.boot_target_updated);
    }

    #[test]
    fn test_oversized_image_is_refused() {
        let mut slots = MemorySlots::new(16);
        assert!(matches!(
            slots.begin_update(17),
            Err(SlotError::TooLarge { size: 17, capacity: 16 })
        ));
    }

    #[test]
    fn test_rollback_without_previous_image_returns() {
        let mut slots = MemorySlots::new(16);
        slots.configure(|f| f.has_previous_image = false);
        assert!(matches!(
            slots.rollback_and_restart(),
            Err(SlotError::NoRollbackTarget)
        ));
    }
}
