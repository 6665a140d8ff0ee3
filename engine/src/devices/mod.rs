//! Device kinds and their dispatch seam.
//!
//! The controller sees a single [`Device`] enum. A dispatched command returns
//! a [`Response`] describing the transfer to perform; the controller owns all
//! transfer state and calls back for multi-block data and received parameter
//! lists. Devices never mutate the controller.

pub mod bridge;
pub mod cdrom;
pub mod daynaport;
pub mod disk;
pub mod factory;
pub mod hd;
pub mod host_services;
pub mod mo;
pub mod mode_pages;
pub mod primary;
pub mod printer;
pub mod state;
pub mod storage;

use std::path::PathBuf;

use retroscsi_protocol::opcode;
use serde::{Deserialize, Serialize};

use crate::error::ScsiFault;
use crate::ShutdownMode;

pub use bridge::HostBridge;
pub use cdrom::CdRom;
pub use daynaport::{DaynaPort, FrameIo};
pub use disk::DiskUnit;
pub use hd::HardDisk;
pub use host_services::HostServices;
pub use mo::OpticalMemory;
pub use printer::Printer;
pub use state::{DeviceState, InitiatorId};

/// Emulated device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// Fixed hard disk
    Hd,
    /// Removable hard disk
    RemovableHd,
    /// Magneto-optical drive
    Mo,
    /// CD-ROM drive
    Cd,
    /// Host services (clock, shutdown)
    HostServices,
    /// DaynaPort SCSI/Link Ethernet adapter
    #[serde(rename = "daynaport")]
    DaynaPort,
    /// Printer
    Printer,
    /// Host bridge stub
    Bridge,
}

/// Per-command context handed to `Device::dispatch`
pub struct CommandContext<'a> {
    /// The received CDB
    pub cdb: &'a [u8],
    /// LUN numbers attached to the dispatching controller (for REPORT LUNS)
    pub attached_luns: &'a [u8],
    /// Initiator that selected the target, if identified
    pub initiator: InitiatorId,
}

/// Transfer plan a device returns from a dispatched command
#[derive(Debug)]
pub enum Response {
    /// No data transfer; proceed to the status phase
    Status,
    /// Send the contained bytes, then status
    DataIn(Vec<u8>),
    /// Multi-block read: the first sector plus the remaining plan
    BlockRead {
        first: Vec<u8>,
        next: u64,
        blocks: u32,
    },
    /// Multi-block write: sector-sized chunks received one at a time
    BlockWrite { lba: u64, chunk: usize, blocks: u32 },
    /// Receive a parameter list, then deliver it to `accept_parameters`
    ParamOut { length: usize },
    /// Receive a raw byte sequence in one handshake, then deliver it to
    /// `write_bytes`
    ByteOut { length: usize },
    /// Request a shutdown, honored at the next bus-free transition
    Shutdown(ShutdownMode),
}

/// One logical unit
#[derive(Debug)]
pub enum Device {
    HardDisk(HardDisk),
    CdRom(CdRom),
    OpticalMemory(OpticalMemory),
    HostServices(HostServices),
    Printer(Printer),
    DaynaPort(DaynaPort),
    Bridge(HostBridge),
}

impl Device {
    pub fn state(&self) -> &DeviceState {
        match self {
            Device::HardDisk(d) => &d.unit.state,
            Device::CdRom(d) => &d.unit.state,
            Device::OpticalMemory(d) => &d.unit.state,
            Device::HostServices(d) => &d.state,
            Device::Printer(d) => &d.state,
            Device::DaynaPort(d) => &d.state,
            Device::Bridge(d) => &d.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut DeviceState {
        match self {
            Device::HardDisk(d) => &mut d.unit.state,
            Device::CdRom(d) => &mut d.unit.state,
            Device::OpticalMemory(d) => &mut d.unit.state,
            Device::HostServices(d) => &mut d.state,
            Device::Printer(d) => &mut d.state,
            Device::DaynaPort(d) => &mut d.state,
            Device::Bridge(d) => &mut d.state,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::HardDisk(d) if d.unit.state.is_removable() => DeviceType::RemovableHd,
            Device::HardDisk(_) => DeviceType::Hd,
            Device::CdRom(_) => DeviceType::Cd,
            Device::OpticalMemory(_) => DeviceType::Mo,
            Device::HostServices(_) => DeviceType::HostServices,
            Device::Printer(_) => DeviceType::Printer,
            Device::DaynaPort(_) => DeviceType::DaynaPort,
            Device::Bridge(_) => DeviceType::Bridge,
        }
    }

    pub fn lun(&self) -> u8 {
        self.state().lun()
    }

    /// The disk core of disk-like kinds
    pub fn disk_unit(&self) -> Option<&DiskUnit> {
        match self {
            Device::HardDisk(d) => Some(&d.unit),
            Device::CdRom(d) => Some(&d.unit),
            Device::OpticalMemory(d) => Some(&d.unit),
            _ => None,
        }
    }

    pub fn disk_unit_mut(&mut self) -> Option<&mut DiskUnit> {
        match self {
            Device::HardDisk(d) => Some(&mut d.unit),
            Device::CdRom(d) => Some(&mut d.unit),
            Device::OpticalMemory(d) => Some(&mut d.unit),
            _ => None,
        }
    }

    /// Execute a command and return the transfer plan
    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match self {
            Device::HardDisk(d) => d.dispatch(ctx),
            Device::CdRom(d) => d.dispatch(ctx),
            Device::OpticalMemory(d) => d.dispatch(ctx),
            Device::HostServices(d) => d.dispatch(ctx),
            Device::Printer(d) => d.dispatch(ctx),
            Device::DaynaPort(d) => d.dispatch(ctx),
            Device::Bridge(d) => d.dispatch(ctx),
        }
    }

    /// Fetch the next sector of a multi-block read
    pub fn read_block(&mut self, lba: u64) -> Result<Vec<u8>, ScsiFault> {
        match self.disk_unit_mut() {
            Some(unit) => unit.read_sector(lba),
            None => Err(ScsiFault::aborted()),
        }
    }

    /// Consume one sector of a multi-block write
    pub fn write_block(&mut self, cdb: &[u8], lba: u64, data: &[u8]) -> Result<(), ScsiFault> {
        match self.disk_unit_mut() {
            Some(unit) => unit.write_sector(cdb, lba, data),
            None => Err(ScsiFault::aborted()),
        }
    }

    /// Deliver a completed parameter-list transfer
    pub fn accept_parameters(&mut self, cdb: &[u8], data: &[u8]) -> Result<(), ScsiFault> {
        match self {
            Device::HardDisk(_) | Device::CdRom(_) | Device::OpticalMemory(_) => {
                match cdb[0] {
                    opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10 => self
                        .disk_unit_mut()
                        .expect("disk kind")
                        .mode_select(cdb, data),
                    _ => Ok(()),
                }
            }
            Device::HostServices(d) => d.accept_parameters(cdb, data),
            Device::DaynaPort(d) => d.accept_parameters(cdb, data),
            Device::Printer(_) | Device::Bridge(_) => Ok(()),
        }
    }

    /// Deliver a completed raw byte transfer
    pub fn write_bytes(&mut self, cdb: &[u8], data: &[u8]) -> Result<(), ScsiFault> {
        match self {
            Device::Printer(d) => d.write_bytes(data),
            Device::DaynaPort(d) => d.write_bytes(cdb, data),
            _ => Ok(()),
        }
    }

    /// Flush any buffered medium state
    pub fn flush_cache(&mut self) {
        if let Some(unit) = self.disk_unit_mut() {
            unit.medium.flush();
        }
    }

    /// Reset after a bus reset or BUS DEVICE RESET
    pub fn reset(&mut self) {
        self.state_mut().reset();
    }

    /// Eject the medium; storage kinds also drop their file binding
    pub fn eject(&mut self, force: bool) -> bool {
        match self.disk_unit_mut() {
            Some(unit) => unit.eject(force),
            None => self.state_mut().eject(force),
        }
    }

    /// Backing file of storage kinds
    pub fn filename(&self) -> Option<PathBuf> {
        self.disk_unit()
            .and_then(|unit| unit.medium.filename().map(PathBuf::from))
    }

    /// Current sector size, 0 for non-storage kinds
    pub fn sector_size(&self) -> u32 {
        self.disk_unit().map_or(0, |unit| unit.medium.sector_size())
    }

    /// Pacing hint for data-in handshakes
    pub fn send_delay(&self) -> u32 {
        match self {
            Device::DaynaPort(d) => d.send_delay(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_tags() {
        assert_eq!(DeviceType::Hd, Device::HardDisk(HardDisk::new(0, false)).device_type());
        assert_eq!(
            DeviceType::RemovableHd,
            Device::HardDisk(HardDisk::new(0, true)).device_type()
        );
        assert_eq!(DeviceType::Cd, Device::CdRom(CdRom::new(0)).device_type());
        assert_eq!(DeviceType::Mo, Device::OpticalMemory(OpticalMemory::new(0)).device_type());
        assert_eq!(
            DeviceType::HostServices,
            Device::HostServices(HostServices::new(0)).device_type()
        );
        assert_eq!(DeviceType::Printer, Device::Printer(Printer::new(0)).device_type());
        assert_eq!(DeviceType::DaynaPort, Device::DaynaPort(DaynaPort::new(0)).device_type());
        assert_eq!(DeviceType::Bridge, Device::Bridge(HostBridge::new(0)).device_type());
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let ctx = CommandContext {
            cdb: &[0xC2, 0, 0, 0, 0, 0],
            attached_luns: &[0],
            initiator: Some(7),
        };
        let mut device = Device::HardDisk(HardDisk::new(0, false));
        let fault = device.dispatch(&ctx).unwrap_err();
        assert_eq!(retroscsi_protocol::asc::INVALID_COMMAND, fault.asc);
    }

    #[test]
    fn test_non_storage_kinds_reject_block_io() {
        let mut device = Device::Printer(Printer::new(0));
        assert!(device.read_block(0).is_err());
        assert!(device.write_block(&[0u8; 6], 0, &[]).is_err());
    }
}
