//! Node Core - hardware-independent logic of the remote node firmware
//!
//! Command bus, line protocol and dispatcher, OTA transfer engine and the
//! boot-health state machine. Everything here runs on the host; the firmware
//! supplies the ESP-IDF [`slots::BootSlots`] implementation.

pub mod bus;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod line;
pub mod ota;
pub mod protocol;
pub mod server;
pub mod slots;

pub use bus::{BusError, CommandBus, FOREVER};
pub use command::Command;
pub use config::NodeConfig;
pub use dispatcher::Dispatcher;
pub use health::{BootHealth, HealthMonitor, HealthState};
pub use ota::{FailureKind, OtaEngine, OtaError};
pub use server::CommandServer;
pub use slots::{BootSlots, ImageState, ImageWriter, SlotError};
