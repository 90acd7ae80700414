// Boot health - decides whether a freshly booted image is kept or rolled back
//
// An image is confirmed the first time the station obtains an address. Until
// then every failed connection attempt counts; reaching the threshold rolls
// back to the previous image once.

use crate::slots::{BootSlots, ImageState};

/// Failed connection attempts tolerated before an unconfirmed image is
/// abandoned.
pub const MAX_CONNECT_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Image not confirmed yet.
    Pending,
    Valid,
    /// Rollback was requested. Terminal.
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Nothing beyond normal operation.
    None,
    ConfirmImage,
    Reconnect,
    /// Abandon the running image; the caller reconnects if this returns.
    Rollback,
}

/// Pure state machine; no I/O.
#[derive(Debug, Clone)]
pub struct BootHealth {
    state: HealthState,
    retries: u32,
    threshold: u32,
    verified: bool,
}

impl BootHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: HealthState::Pending,
            retries: 0,
            threshold,
            verified: false,
        }
    }

    /// Start from an image the bootloader already trusts.
    pub fn confirmed(threshold: u32) -> Self {
        Self {
            state: HealthState::Valid,
            ..Self::new(threshold)
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether the station has ever obtained an address this boot.
    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn on_address_acquired(&mut self) -> HealthAction {
        if self.verified {
            return HealthAction::None;
        }
        self.verified = true;

        match self.state {
            HealthState::Pending => {
                self.state = HealthState::Valid;
                HealthAction::ConfirmImage
            }
            HealthState::Valid | HealthState::RolledBack => HealthAction::None,
        }
    }

    /// Failures are counted until the image is valid, including after a
    /// rollback that could not be carried out. Only the first crossing of the
    /// threshold asks for a rollback.
    pub fn on_connection_failed(&mut self) -> HealthAction {
        if self.state == HealthState::Valid {
            return HealthAction::Reconnect;
        }

        self.retries = self.retries.saturating_add(1);
        if self.state == HealthState::Pending && self.retries >= self.threshold {
            self.state = HealthState::RolledBack;
            HealthAction::Rollback
        } else {
            HealthAction::Reconnect
        }
    }
}

/// [`BootHealth`] bound to the boot slots it acts on.
pub struct HealthMonitor<S: BootSlots> {
    health: BootHealth,
    slots: S,
}

impl<S: BootSlots> HealthMonitor<S> {
    /// Images that are not yet valid in the bootloader's eyes start unconfirmed.
    pub fn new(slots: S, threshold: u32) -> Self {
        let health = match slots.running_image_state() {
            Ok(ImageState::Valid) => BootHealth::confirmed(threshold),
            Ok(state) => {
                log::info!("Boot health: running image is {state:?}, awaiting network");
                BootHealth::new(threshold)
            }
            Err(e) => {
                log::warn!("Boot health: image state unknown ({e}), awaiting network");
                BootHealth::new(threshold)
            }
        };
        Self { health, slots }
    }

    pub fn state(&self) -> HealthState {
        self.health.state()
    }

    pub fn retries(&self) -> u32 {
        self.health.retries()
    }

    pub fn address_acquired(&mut self) -> HealthAction {
        let action = self.health.on_address_acquired();
        if action == HealthAction::ConfirmImage {
            match self.slots.mark_running_valid() {
                Ok(()) => log::info!("Boot health: image confirmed, rollback cancelled"),
                Err(e) => log::error!("Boot health: failed to confirm image: {e}"),
            }
        }
        action
    }

    /// Record a failed attempt. Returns the action taken; after it the caller
    /// reconnects.
    pub fn connection_failed(&mut self) -> HealthAction {
        let action = self.health.on_connection_failed();
        match action {
            HealthAction::Rollback => {
                log::error!(
                    "Boot health: {} failed connections with an unconfirmed image, rolling back",
                    self.health.retries()
                );
                if let Err(e) = self.slots.rollback_and_restart() {
                    log::error!("Boot health: rollback impossible ({e}), staying on this image");
                }
            }
            HealthAction::Reconnect if self.health.state() == HealthState::Pending => {
                log::warn!(
                    "Boot health: connection failed ({}/{})",
                    self.health.retries(),
                    self.health.threshold
                );
            }
            _ => {}
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::{MemorySlots, RestartRequested};
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_first_address_confirms_once() {
        let mut health = BootHealth::new(MAX_CONNECT_RETRIES);
        assert_eq!(health.on_address_acquired(), HealthAction::ConfirmImage);
        assert_eq!(health.state(), HealthState::Valid);
        assert!(health.verified());

        assert_eq!(health.on_address_acquired(), HealthAction::None);
    }

    #[test]
    fn test_threshold_failures_roll_back_exactly_once() {
        let mut health = BootHealth::new(MAX_CONNECT_RETRIES);
        for _ in 1..MAX_CONNECT_RETRIES {
            assert_eq!(health.on_connection_failed(), HealthAction::Reconnect);
        }
        assert_eq!(health.on_connection_failed(), HealthAction::Rollback);
        assert_eq!(health.state(), HealthState::RolledBack);

        assert_eq!(health.on_connection_failed(), HealthAction::Reconnect);
        assert_eq!(health.state(), HealthState::RolledBack);
        assert_eq!(health.retries(), MAX_CONNECT_RETRIES + 1);
    }

    #[test]
    fn test_failures_after_confirmation_never_roll_back() {
        let mut health = BootHealth::new(MAX_CONNECT_RETRIES);
        health.on_connection_failed();
        health.on_address_acquired();

        for _ in 0..MAX_CONNECT_RETRIES * 2 {
            assert_eq!(health.on_connection_failed(), HealthAction::Reconnect);
        }
        assert_eq!(health.state(), HealthState::Valid);
        assert_eq!(health.retries(), 1);
    }

    #[test]
    fn test_monitor_starts_valid_for_trusted_image() {
        let slots = MemorySlots::new(16);
        slots.configure(|f| f.running_state = ImageState::Valid);
        let mut monitor = HealthMonitor::new(slots.clone(), MAX_CONNECT_RETRIES);

        assert_eq!(monitor.state(), HealthState::Valid);
        assert_eq!(monitor.address_acquired(), HealthAction::None);
        assert_eq!(slots.snapshot().marked_valid, 0);
    }

    #[test]
    fn test_monitor_marks_image_valid_on_first_address() {
        let slots = MemorySlots::new(16);
        let mut monitor = HealthMonitor::new(slots.clone(), MAX_CONNECT_RETRIES);

        assert_eq!(monitor.address_acquired(), HealthAction::ConfirmImage);
        monitor.address_acquired();

        let flash = slots.snapshot();
        assert_eq!(flash.marked_valid, 1);
        assert_eq!(flash.running_state, ImageState::Valid);
    }

    #[test]
    fn test_monitor_rolls_back_on_fifth_failure() {
        let slots = MemorySlots::new(16);
        let mut monitor = HealthMonitor::new(slots.clone(), MAX_CONNECT_RETRIES);

        for _ in 1..MAX_CONNECT_RETRIES {
            monitor.connection_failed();
        }
        assert_eq!(slots.snapshot().rollbacks, 0);

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| monitor.connection_failed()))
            .expect_err("rollback restarts the device");
        assert_eq!(
            unwound.downcast_ref::<RestartRequested>(),
            Some(&RestartRequested { rollback: true })
        );
        assert_eq!(slots.snapshot().rollbacks, 1);
    }

    #[test]
    fn test_failed_rollback_keeps_running() {
        let slots = MemorySlots::new(16);
        slots.configure(|f| f.has_previous_image = false);
        let mut monitor = HealthMonitor::new(slots.clone(), 2);

        assert_eq!(monitor.connection_failed(), HealthAction::Reconnect);
        assert_eq!(monitor.connection_failed(), HealthAction::Rollback);
        assert_eq!(monitor.state(), HealthState::RolledBack);
        assert_eq!(monitor.connection_failed(), HealthAction::Reconnect);
        assert_eq!(monitor.connection_failed(), HealthAction::Reconnect);
        assert_eq!(monitor.retries(), 4);
        assert_eq!(slots.snapshot().rollbacks, 0);
    }
}
