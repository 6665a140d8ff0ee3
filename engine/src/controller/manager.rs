//! Controller lifecycle and the backing-file reservation table.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::bus::Bus;
use crate::controller::Controller;
use crate::devices::Device;
use crate::ShutdownMode;

/// Owns one controller per target id and tracks which image files are
/// attached, so the same file cannot back two devices at once.
#[derive(Debug, Default)]
pub struct ControllerManager {
    controllers: BTreeMap<u8, Controller>,
    reserved_files: HashMap<PathBuf, (u8, u8)>,
}

impl ControllerManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    /// Attach a device to the controller of `target_id`. Attaching LUN 0 to
    /// an id without a controller creates one; any other LUN requires an
    /// existing controller.
    pub fn attach(&mut self, target_id: u8, device: Device) -> Result<()> {
        if target_id > 7 {
            bail!("invalid target id {target_id}");
        }

        let lun = device.lun();
        if let Some(path) = device.filename() {
            if let Some((id, lun)) = self.reserved_files.get(&path) {
                bail!(
                    "image file {} is already attached to device {id}:{lun}",
                    path.display()
                );
            }
        }
        let filename = device.filename();

        if let Some(controller) = self.controllers.get_mut(&target_id) {
            if !controller.add_device(device) {
                bail!("LUN {lun} of target {target_id} is not available");
            }
        } else {
            if lun != 0 {
                bail!("target {target_id} requires LUN 0 before LUN {lun} can be attached");
            }
            let mut controller = Controller::new(target_id);
            if !controller.add_device(device) {
                bail!("LUN {lun} of target {target_id} is not available");
            }
            self.controllers.insert(target_id, controller);
        }

        if let Some(path) = filename {
            self.reserved_files.insert(path, (target_id, lun));
        }

        info!(target_id, lun, "device attached");
        Ok(())
    }

    /// Detach one LUN, flushing its cache and releasing its backing file
    pub fn detach(&mut self, target_id: u8, lun: u8) -> Result<Device> {
        let controller = self
            .controllers
            .get_mut(&target_id)
            .with_context(|| format!("no controller for target {target_id}"))?;
        let mut device = controller
            .remove_device(lun)
            .with_context(|| format!("no device at {target_id}:{lun}"))?;

        device.flush_cache();
        if let Some(path) = device.filename() {
            self.reserved_files.remove(&path);
        }

        info!(target_id, lun, "device detached");
        Ok(device)
    }

    /// Eject the medium of a removable device and release its backing file
    pub fn eject(&mut self, target_id: u8, lun: u8, force: bool) -> bool {
        let Some(device) = self.device_mut(target_id, lun) else {
            return false;
        };
        let path = device.filename();
        if !device.eject(force) {
            return false;
        }
        if let Some(path) = path {
            self.reserved_files.remove(&path);
        }
        true
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn has_controller(&self, target_id: u8) -> bool {
        self.controllers.contains_key(&target_id)
    }

    pub fn controller(&self, target_id: u8) -> Option<&Controller> {
        self.controllers.get(&target_id)
    }

    pub fn controller_mut(&mut self, target_id: u8) -> Option<&mut Controller> {
        self.controllers.get_mut(&target_id)
    }

    pub fn device(&self, target_id: u8, lun: u8) -> Option<&Device> {
        self.controllers.get(&target_id)?.device(lun)
    }

    pub fn device_mut(&mut self, target_id: u8, lun: u8) -> Option<&mut Device> {
        self.controllers.get_mut(&target_id)?.device_mut(lun)
    }

    /// `(target_id, lun)` pairs of all attached devices, ordered by id
    pub fn device_ids(&self) -> Vec<(u8, u8)> {
        let mut ids = Vec::new();
        for (id, controller) in &self.controllers {
            for lun in controller.attached_luns() {
                ids.push((*id, lun));
            }
        }
        ids
    }

    /// The `(id, lun)` holding a backing file, if any
    pub fn ids_for_reserved_file(&self, path: &Path) -> Option<(u8, u8)> {
        self.reserved_files.get(path).copied()
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Remove one controller, flushing all its devices and releasing their
    /// backing files
    pub fn delete_controller(&mut self, target_id: u8) -> bool {
        let Some(mut controller) = self.controllers.remove(&target_id) else {
            return false;
        };
        for device in controller.devices_mut() {
            device.flush_cache();
            if let Some(path) = device.filename() {
                self.reserved_files.remove(&path);
            }
        }
        true
    }

    pub fn delete_all_controllers(&mut self) {
        let ids: Vec<u8> = self.controllers.keys().copied().collect();
        for id in ids {
            self.delete_controller(id);
        }
        debug_assert!(self.controllers.is_empty());
    }

    /// Reset every controller and every attached LUN
    pub fn reset_all(&mut self) {
        for controller in self.controllers.values_mut() {
            controller.reset();
        }
    }

    // ========================================================================
    // Bus events
    // ========================================================================

    /// Run the transaction for a selection event on the controller addressed
    /// by `id_data` (the DAT byte at selection). Returns the shutdown mode a
    /// host-services LUN may have requested; flushing already happened at the
    /// bus-free transition.
    pub fn process_on_controller(&mut self, bus: &mut dyn Bus, id_data: u8) -> ShutdownMode {
        let Some(controller) = self
            .controllers
            .values_mut()
            .find(|controller| id_data & (1 << controller.target_id()) != 0)
        else {
            return ShutdownMode::None;
        };

        let mode = controller.process_transaction(bus, id_data);
        if mode != ShutdownMode::None {
            for controller in self.controllers.values_mut() {
                for device in controller.devices_mut() {
                    device.flush_cache();
                }
            }
        }
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{HardDisk, HostServices, Printer};

    fn hd(lun: u8) -> Device {
        Device::HardDisk(HardDisk::new(lun, false))
    }

    #[test]
    fn test_attach_requires_lun0_first() {
        let mut manager = ControllerManager::new();

        assert!(manager.attach(4, hd(1)).is_err());
        assert!(!manager.has_controller(4));

        manager.attach(4, hd(0)).unwrap();
        assert!(manager.has_controller(4));
        manager.attach(4, hd(1)).unwrap();
        assert_eq!(2, manager.controller(4).unwrap().lun_count());
    }

    #[test]
    fn test_attach_rejects_duplicate_lun() {
        let mut manager = ControllerManager::new();
        manager.attach(0, hd(0)).unwrap();
        assert!(manager.attach(0, hd(0)).is_err());
    }

    #[test]
    fn test_attach_rejects_invalid_target_id() {
        let mut manager = ControllerManager::new();
        assert!(manager.attach(8, hd(0)).is_err());
    }

    #[test]
    fn test_backing_file_reservation() {
        let mut manager = ControllerManager::new();

        let mut disk = HardDisk::new(0, false);
        disk.unit.medium.set_filename("image.hds");
        manager.attach(1, Device::HardDisk(disk)).unwrap();
        assert_eq!(
            Some((1, 0)),
            manager.ids_for_reserved_file(Path::new("image.hds"))
        );

        let mut other = HardDisk::new(0, false);
        other.unit.medium.set_filename("image.hds");
        assert!(
            manager.attach(2, Device::HardDisk(other)).is_err(),
            "one file must not back two devices"
        );

        manager.detach(1, 0).unwrap();
        assert_eq!(None, manager.ids_for_reserved_file(Path::new("image.hds")));
    }

    #[test]
    fn test_device_lookup() {
        let mut manager = ControllerManager::new();
        manager.attach(2, hd(0)).unwrap();
        manager
            .attach(2, Device::Printer(Printer::new(4)))
            .unwrap();

        assert!(manager.device(2, 0).is_some());
        assert!(manager.device(2, 4).is_some());
        assert!(manager.device(2, 1).is_none());
        assert!(manager.device(3, 0).is_none());
        assert_eq!(vec![(2, 0), (2, 4)], manager.device_ids());
    }

    #[test]
    fn test_delete_controller_releases_files() {
        let mut manager = ControllerManager::new();
        let mut disk = HardDisk::new(0, false);
        disk.unit.medium.set_filename("image.hds");
        manager.attach(5, Device::HardDisk(disk)).unwrap();

        assert!(manager.delete_controller(5));
        assert!(!manager.has_controller(5));
        assert_eq!(None, manager.ids_for_reserved_file(Path::new("image.hds")));
        assert!(!manager.delete_controller(5));
    }

    #[test]
    fn test_delete_all_controllers() {
        let mut manager = ControllerManager::new();
        manager.attach(0, hd(0)).unwrap();
        manager
            .attach(6, Device::HostServices(HostServices::new(0)))
            .unwrap();

        manager.delete_all_controllers();
        assert!(!manager.has_controller(0));
        assert!(!manager.has_controller(6));
    }

    #[test]
    fn test_reset_all() {
        let mut manager = ControllerManager::new();
        manager.attach(0, hd(0)).unwrap();
        manager
            .device_mut(0, 0)
            .unwrap()
            .state_mut()
            .set_locked(true);

        manager.reset_all();
        assert!(!manager.device(0, 0).unwrap().state().is_locked());
    }

    #[test]
    fn test_eject_releases_reserved_file() {
        let mut manager = ControllerManager::new();
        let mut disk = HardDisk::new(0, true);
        disk.unit.medium.set_filename("removable.hds");
        manager.attach(3, Device::HardDisk(disk)).unwrap();

        // Not ready: eject fails, reservation stays
        assert!(!manager.eject(3, 0, false));
        assert!(manager
            .ids_for_reserved_file(Path::new("removable.hds"))
            .is_some());

        manager
            .device_mut(3, 0)
            .unwrap()
            .state_mut()
            .set_ready(true);
        assert!(manager.eject(3, 0, false));
        assert!(manager
            .ids_for_reserved_file(Path::new("removable.hds"))
            .is_none());
    }
}
