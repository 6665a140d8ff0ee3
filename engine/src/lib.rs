//! SCSI target engine.
//!
//! Emulates SCSI peripherals (disks, CD-ROM, magneto-optical drives,
//! printers, a DaynaPort Ethernet adapter and host utility LUNs) behind a
//! [`Bus`] capability. The physical GPIO layer, the control plane and the
//! host-side drivers live outside this crate; the engine's entry point is
//! [`controller::manager::ControllerManager::process_on_controller`], called
//! by the bus poll loop for every selection event.

pub mod bus;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::Bus;
pub use controller::manager::ControllerManager;
pub use controller::Controller;
pub use devices::{Device, DeviceType};
pub use error::{ImageError, ScsiFault};

/// Shutdown request raised by the host-services device, honored once the bus
/// is free and all caches are flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// No shutdown requested
    #[default]
    None,
    /// Exit the emulator process
    StopEmulator,
    /// Power down the host machine
    StopHost,
    /// Reboot the host machine
    RestartHost,
}
