//! Device construction from attach-time options.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::devices::{
    CdRom, DaynaPort, Device, DeviceType, HardDisk, HostBridge, HostServices, OpticalMemory,
    Printer,
};

/// Attach-time options as key/value strings, as delivered by the control
/// plane
pub type DeviceParams = BTreeMap<String, String>;

/// Extensions opened by the NEC hard-disk flavor
const NEC_EXTENSIONS: [&str; 3] = ["hdn", "hdi", "nhd"];

/// Option keys a device type accepts
fn allowed_params(device_type: DeviceType) -> &'static [&'static str] {
    match device_type {
        DeviceType::Hd | DeviceType::RemovableHd | DeviceType::Mo => {
            &["file", "block_size", "vendor", "product", "revision"]
        }
        DeviceType::Cd => &["file", "block_size", "vendor", "product", "revision"],
        DeviceType::HostServices | DeviceType::Bridge => &["vendor", "product", "revision"],
        DeviceType::DaynaPort => &["interface", "inet", "vendor", "product", "revision"],
        DeviceType::Printer => &["cmd", "timeout", "vendor", "product", "revision"],
    }
}

/// Default option values presented to the control plane
pub fn default_params(device_type: DeviceType) -> DeviceParams {
    let mut params = DeviceParams::new();
    match device_type {
        DeviceType::Printer => {
            params.insert("cmd".to_string(), "lp -oraw %f".to_string());
            params.insert("timeout".to_string(), "30".to_string());
        }
        DeviceType::DaynaPort => {
            params.insert("interface".to_string(), "eth0".to_string());
            params.insert("inet".to_string(), "10.10.20.1/24".to_string());
        }
        _ => {}
    }
    params
}

/// Derive the device type from an image file extension
pub fn device_type_for_file(path: &Path) -> Option<DeviceType> {
    let extension = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match extension.as_str() {
        "hds" | "hda" | "hd1" | "hdn" | "hdi" | "nhd" => Some(DeviceType::Hd),
        "hdr" => Some(DeviceType::RemovableHd),
        "mos" => Some(DeviceType::Mo),
        "iso" | "is1" => Some(DeviceType::Cd),
        _ => None,
    }
}

fn is_nec_image(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|e| NEC_EXTENSIONS.contains(&e.as_str()))
}

/// Create a device of `device_type` at `lun`, applying and validating the
/// attach-time options. Storage devices with a `file` option open and
/// validate their image here.
pub fn create_device(device_type: DeviceType, lun: u8, params: &DeviceParams) -> Result<Device> {
    let allowed = allowed_params(device_type);
    for key in params.keys() {
        if !allowed.contains(&key.as_str()) {
            bail!("unknown option '{key}' for device type {device_type:?}");
        }
    }

    let mut device = match device_type {
        DeviceType::Hd => {
            let nec = params
                .get("file")
                .map(|file| is_nec_image(Path::new(file)))
                .unwrap_or(false);
            if nec {
                Device::HardDisk(HardDisk::new_nec(lun))
            } else {
                Device::HardDisk(HardDisk::new(lun, false))
            }
        }
        DeviceType::RemovableHd => Device::HardDisk(HardDisk::new(lun, true)),
        DeviceType::Mo => Device::OpticalMemory(OpticalMemory::new(lun)),
        DeviceType::Cd => Device::CdRom(CdRom::new(lun)),
        DeviceType::HostServices => Device::HostServices(HostServices::new(lun)),
        DeviceType::DaynaPort => Device::DaynaPort(DaynaPort::new(lun)),
        DeviceType::Printer => Device::Printer(Printer::new(lun)),
        DeviceType::Bridge => Device::Bridge(HostBridge::new(lun)),
    };

    apply_identity(&mut device, params)?;

    if let Some(size) = params.get("block_size") {
        let size: u32 = size
            .parse()
            .with_context(|| format!("invalid block_size '{size}'"))?;
        let unit = device
            .disk_unit_mut()
            .context("block_size is only valid for disk devices")?;
        if !unit.medium.set_configured_sector_size(size) {
            bail!("block size {size} is not supported by this device type");
        }
    }

    if let Some(cmd) = params.get("cmd") {
        let Device::Printer(printer) = &mut device else {
            unreachable!("cmd is only allowed for printers");
        };
        if !printer.set_print_cmd(cmd) {
            bail!("print command '{cmd}' does not reference the spool file with %f");
        }
    }
    if let Some(timeout) = params.get("timeout") {
        let secs: u32 = timeout
            .parse()
            .with_context(|| format!("invalid timeout '{timeout}'"))?;
        if let Device::Printer(printer) = &mut device {
            printer.set_timeout(secs);
        }
    }

    if let Some(file) = params.get("file") {
        open_image(&mut device, file)
            .with_context(|| format!("cannot attach image file {file}"))?;
    }

    Ok(device)
}

fn apply_identity(device: &mut Device, params: &DeviceParams) -> Result<()> {
    if let Some(vendor) = params.get("vendor") {
        if vendor.is_empty() || vendor.len() > 8 {
            bail!("vendor string '{vendor}' must be 1..=8 characters");
        }
        device.state_mut().set_vendor(vendor);
    }
    if let Some(product) = params.get("product") {
        if product.is_empty() || product.len() > 16 {
            bail!("product string '{product}' must be 1..=16 characters");
        }
        device.state_mut().set_product(product, true);
    }
    if let Some(revision) = params.get("revision") {
        if revision.is_empty() || revision.len() > 4 {
            bail!("revision string '{revision}' must be 1..=4 characters");
        }
        device.state_mut().set_revision(revision);
    }
    Ok(())
}

fn open_image(device: &mut Device, file: &str) -> Result<()> {
    match device {
        Device::HardDisk(hd) => {
            hd.unit.medium.set_filename(file);
            hd.open()?;
        }
        Device::CdRom(cd) => {
            cd.unit.medium.set_filename(file);
            cd.open()?;
        }
        Device::OpticalMemory(mo) => {
            mo.unit.medium.set_filename(file);
            mo.open()?;
        }
        _ => bail!("device type {:?} does not take an image file", device.device_type()),
    }
    Ok(())
}
