//! Backing-image handling for storage devices.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use tracing::debug;

use crate::devices::state::DeviceState;
use crate::error::ImageError;

/// Sector sizes a SCSI disk can present, as powers of two (shift 9..=12)
pub const STANDARD_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

fn shift_for_sector_size(size: u32) -> Option<u8> {
    match size {
        512 => Some(9),
        1024 => Some(10),
        2048 => Some(11),
        4096 => Some(12),
        _ => None,
    }
}

/// An open image file addressed in fixed-size stored sectors.
///
/// `stride` is the stored bytes per sector; the logical payload of
/// `sector_size` bytes starts `data_offset` bytes into each stored sector.
/// Raw CD-ROM tracks use a larger stride with a header skip; plain images use
/// `stride == sector_size` and no offset.
#[derive(Debug)]
struct SectorFile {
    file: File,
    base: u64,
    stride: u32,
    data_offset: u32,
    writable: bool,
}

/// File binding, geometry and sector I/O of a storage device.
#[derive(Debug)]
pub struct StorageMedium {
    filename: Option<PathBuf>,
    file: Option<SectorFile>,
    block_count: u64,
    sector_shift: u8,
    supported_sector_sizes: BTreeSet<u32>,
    configured_sector_size: Option<u32>,
    medium_changed: bool,
}

impl StorageMedium {
    /// `supported` lists the sector sizes the device can be reconfigured to;
    /// an empty list means the size is fixed.
    pub fn new(supported: &[u32]) -> Self {
        Self {
            filename: None,
            file: None,
            block_count: 0,
            sector_shift: 9,
            supported_sector_sizes: supported.iter().copied().collect(),
            configured_sector_size: None,
            medium_changed: false,
        }
    }

    // ========================================================================
    // Filename
    // ========================================================================

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: impl Into<PathBuf>) {
        self.filename = Some(filename.into());
    }

    pub fn file_size(&self) -> Result<u64, ImageError> {
        let path = self.filename.as_ref().ok_or(ImageError::MissingFilename)?;
        let meta =
            std::fs::metadata(path).map_err(|_| ImageError::FileNotFound(path.clone()))?;
        Ok(meta.len())
    }

    /// Whether the backing file itself denies writing
    pub fn is_read_only_file(&self) -> Result<bool, ImageError> {
        let path = self.filename.as_ref().ok_or(ImageError::MissingFilename)?;
        Ok(access(path.as_path(), AccessFlags::W_OK).is_err())
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn set_block_count(&mut self, blocks: u64) {
        self.block_count = blocks;
    }

    pub fn sector_size(&self) -> u32 {
        1 << self.sector_shift
    }

    pub fn sector_shift(&self) -> u8 {
        self.sector_shift
    }

    pub fn set_sector_shift(&mut self, shift: u8) {
        debug_assert!((9..=12).contains(&shift));
        self.sector_shift = shift;
    }

    /// Change the sector size of the medium. The stored data is reinterpreted
    /// at the new granularity, so the block count is rederived from the image
    /// size for plain images.
    pub fn set_sector_size(&mut self, size: u32) -> Result<(), ImageError> {
        let shift = shift_for_sector_size(size).ok_or(ImageError::UnsupportedSectorSize(size))?;
        self.sector_shift = shift;
        if let Some(file) = &mut self.file {
            if file.data_offset == 0 && file.base == 0 {
                file.stride = size;
                if let Ok(len) = file.file.metadata().map(|m| m.len()) {
                    self.block_count = len / u64::from(size);
                }
            }
        }
        Ok(())
    }

    pub fn is_sector_size_configurable(&self) -> bool {
        !self.supported_sector_sizes.is_empty()
    }

    pub fn supported_sector_sizes(&self) -> &BTreeSet<u32> {
        &self.supported_sector_sizes
    }

    pub fn supports_sector_size(&self, size: u32) -> bool {
        self.supported_sector_sizes.contains(&size)
    }

    /// Configured sector size override from the attach-time options
    pub fn configured_sector_size(&self) -> Option<u32> {
        self.configured_sector_size
    }

    /// Record a sector size override. Accepted only if the device supports
    /// the size (or, for fixed-size devices, if it is a standard size).
    pub fn set_configured_sector_size(&mut self, size: u32) -> bool {
        let valid = if self.supported_sector_sizes.is_empty() {
            STANDARD_SECTOR_SIZES.contains(&size)
        } else {
            self.supported_sector_sizes.contains(&size)
        };
        if valid {
            self.configured_sector_size = Some(size);
        }
        valid
    }

    // ========================================================================
    // Medium change
    // ========================================================================

    pub fn is_medium_changed(&self) -> bool {
        self.medium_changed
    }

    pub fn set_medium_changed(&mut self, changed: bool) {
        self.medium_changed = changed;
    }

    // ========================================================================
    // File binding and sector I/O
    // ========================================================================

    /// Open the backing file and address it with the given layout.
    ///
    /// The file is opened read-write when permitted, read-only otherwise;
    /// write protection is reflected into the device state by
    /// [`StorageMedium::validate`].
    pub fn bind_file(&mut self, base: u64, stride: u32, data_offset: u32) -> Result<(), ImageError> {
        let path = self.filename.as_ref().ok_or(ImageError::MissingFilename)?;
        if !path.exists() {
            return Err(ImageError::FileNotFound(path.clone()));
        }

        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => (file, true),
            Err(_) => (File::open(path)?, false),
        };

        debug!(path = %path.display(), base, stride, "image attached");
        self.file = Some(SectorFile {
            file,
            base,
            stride,
            data_offset,
            writable,
        });
        self.medium_changed = true;
        Ok(())
    }

    /// Shorthand for a plain sector-stream image at the current sector size
    pub fn bind_plain_file(&mut self) -> Result<(), ImageError> {
        let size = self.file_size()?;
        let sector = u64::from(self.sector_size());
        if size < sector {
            return Err(ImageError::FileTooSmall {
                path: self.filename.clone().unwrap_or_default(),
                size,
                minimum: sector,
            });
        }
        self.block_count = size / sector;
        self.bind_file(0, self.sector_size(), 0)
    }

    /// Check the bound file and reconcile the device flags: a file that is
    /// read-only on disk clears `protectable`/`protected` and forces
    /// `read_only`. Leaves the device ready.
    pub fn validate(&mut self, state: &mut DeviceState) -> Result<(), ImageError> {
        if self.block_count == 0 {
            return Err(ImageError::NoCapacity);
        }
        let path = self.filename.as_ref().ok_or(ImageError::MissingFilename)?;
        if !path.exists() {
            return Err(ImageError::FileNotFound(path.clone()));
        }

        if self.is_read_only_file()? {
            state.set_read_only(true);
            state.set_protectable(false);
            state.set_protected(false);
        }

        state.set_stopped(false);
        state.set_removed(false);
        state.set_locked(false);
        state.set_ready(true);
        Ok(())
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    /// Read one sector
    pub fn read_block(&self, lba: u64) -> Result<Vec<u8>, ImageError> {
        let file = self.file.as_ref().ok_or(ImageError::MissingFilename)?;
        let mut data = vec![0u8; self.sector_size() as usize];
        let pos = file.base + lba * u64::from(file.stride) + u64::from(file.data_offset);
        file.file.read_exact_at(&mut data, pos)?;
        Ok(data)
    }

    /// Write one sector
    pub fn write_block(&mut self, lba: u64, data: &[u8]) -> Result<(), ImageError> {
        let file = self.file.as_ref().ok_or(ImageError::MissingFilename)?;
        if !file.writable {
            return Err(ImageError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        let pos = file.base + lba * u64::from(file.stride) + u64::from(file.data_offset);
        file.file.write_all_at(data, pos)?;
        Ok(())
    }

    /// Flush buffered sectors to stable storage
    pub fn flush(&mut self) {
        if let Some(file) = &self.file {
            if file.writable {
                let _ = file.file.sync_all();
            }
        }
    }

    /// Drop the file binding (eject)
    pub fn detach_file(&mut self) {
        self.file = None;
        self.filename = None;
        self.block_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroscsi_protocol::scsi_level;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file
    }

    #[test]
    fn test_sector_size_shift_mapping() {
        let mut medium = StorageMedium::new(&[512, 1024]);
        assert!(medium.is_sector_size_configurable());

        for (shift, size) in [(9u8, 512u32), (10, 1024), (11, 2048), (12, 4096)] {
            medium.set_sector_shift(shift);
            assert_eq!(shift, medium.sector_shift());
            assert_eq!(size, medium.sector_size());
            medium.set_sector_size(size).unwrap();
            assert_eq!(shift, medium.sector_shift());
        }

        assert!(matches!(
            medium.set_sector_size(1234),
            Err(ImageError::UnsupportedSectorSize(1234))
        ));

        let fixed = StorageMedium::new(&[]);
        assert!(!fixed.is_sector_size_configurable());
    }

    #[test]
    fn test_configured_sector_size() {
        let mut medium = StorageMedium::new(&[]);
        assert!(medium.set_configured_sector_size(512));
        assert_eq!(Some(512), medium.configured_sector_size());
        assert!(!medium.set_configured_sector_size(1234));
        assert_eq!(Some(512), medium.configured_sector_size());

        let mut limited = StorageMedium::new(&[512, 2048]);
        assert!(!limited.set_configured_sector_size(1024));
        assert!(limited.set_configured_sector_size(2048));
    }

    #[test]
    fn test_validate_missing_file() {
        let mut state = DeviceState::new(0, scsi_level::SCSI_2);
        let mut medium = StorageMedium::new(&[]);

        medium.set_filename("/non_existing_file");
        medium.set_block_count(0);
        assert!(matches!(
            medium.validate(&mut state),
            Err(ImageError::NoCapacity)
        ));

        medium.set_block_count(1);
        assert!(matches!(
            medium.validate(&mut state),
            Err(ImageError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_validate_downgrades_read_only_files() {
        let file = image(512);
        let mut state = DeviceState::new(0, scsi_level::SCSI_2);
        let mut medium = StorageMedium::new(&[]);
        medium.set_filename(file.path());
        medium.set_block_count(1);

        state.set_read_only(false);
        state.set_protectable(true);
        medium.validate(&mut state).unwrap();
        assert!(!state.is_read_only());
        assert!(state.is_protectable());
        assert!(state.is_ready());
        assert!(!state.is_stopped());
        assert!(!state.is_removed());
        assert!(!state.is_locked());

        let mut perms = std::fs::metadata(file.path()).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(file.path(), perms).unwrap();

        state.set_read_only(false);
        state.set_protectable(true);
        medium.validate(&mut state).unwrap();
        assert!(state.is_read_only());
        assert!(!state.is_protectable());
        assert!(!state.is_protected());
    }

    #[test]
    fn test_medium_changed_flag() {
        let mut medium = StorageMedium::new(&[]);
        medium.set_medium_changed(true);
        assert!(medium.is_medium_changed());
        medium.set_medium_changed(false);
        assert!(!medium.is_medium_changed());
    }

    #[test]
    fn test_plain_file_io_roundtrip() {
        let file = image(2 * 512);
        let mut medium = StorageMedium::new(&[]);
        medium.set_filename(file.path());
        medium.bind_plain_file().unwrap();
        assert_eq!(2, medium.block_count());
        assert!(medium.is_medium_changed());

        let payload = vec![0xA5u8; 512];
        medium.write_block(1, &payload).unwrap();
        medium.flush();
        assert_eq!(payload, medium.read_block(1).unwrap());
        assert_eq!(vec![0u8; 512], medium.read_block(0).unwrap());
    }

    #[test]
    fn test_bind_plain_file_too_small() {
        let file = image(511);
        let mut medium = StorageMedium::new(&[]);
        medium.set_filename(file.path());
        assert!(matches!(
            medium.bind_plain_file(),
            Err(ImageError::FileTooSmall { .. })
        ));
    }

    #[test]
    fn test_detach_file() {
        let file = image(512);
        let mut medium = StorageMedium::new(&[]);
        medium.set_filename(file.path());
        medium.bind_plain_file().unwrap();

        medium.detach_file();
        assert!(!medium.has_file());
        assert_eq!(0, medium.block_count());
        assert!(medium.filename().is_none());
    }
}
