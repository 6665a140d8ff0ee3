//! SCSI hard disk, including the NEC legacy-container flavor.

use std::fs::File;
use std::io::Read;

use retroscsi_protocol::wire::{set_u16, set_u24, InquiryData};
use retroscsi_protocol::{device_type, mode_page, scsi_level};
use tracing::info;

use crate::devices::disk::DiskUnit;
use crate::devices::mode_pages::{self, page_frame, ModePages};
use crate::devices::primary;
use crate::devices::{CommandContext, Response};
use crate::error::{ImageError, ScsiFault};

const HD_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

/// NHD container signature
const NHD_SIGNATURE: &[u8; 14] = b"T98HDDIMAGE.R0";

/// Geometry carried by a NEC container header
#[derive(Debug, Clone, Copy)]
struct NecGeometry {
    cylinders: u32,
    heads: u8,
}

#[derive(Debug)]
enum HdFlavor {
    Standard,
    Nec { geometry: Option<NecGeometry> },
}

/// Direct-access hard disk LUN
#[derive(Debug)]
pub struct HardDisk {
    pub unit: DiskUnit,
    flavor: HdFlavor,
}

impl HardDisk {
    pub fn new(lun: u8, removable: bool) -> Self {
        let mut unit = DiskUnit::new(lun, scsi_level::SCSI_2, &HD_SECTOR_SIZES);
        unit.state.set_protectable(true);
        unit.state.set_stoppable(true);
        unit.state.set_supports_save_parameters(true);
        if removable {
            unit.state.set_removable(true);
            unit.state.set_lockable(true);
        }
        Self {
            unit,
            flavor: HdFlavor::Standard,
        }
    }

    /// NEC flavor for `.hdn`/`.hdi`/`.nhd` legacy containers. The sector size
    /// comes from the container and is not reconfigurable.
    pub fn new_nec(lun: u8) -> Self {
        let mut unit = DiskUnit::new(lun, scsi_level::SCSI_1_CCS, &[]);
        unit.state.set_protectable(true);
        unit.state.set_stoppable(true);
        unit.state.set_supports_save_parameters(true);
        Self {
            unit,
            flavor: HdFlavor::Nec { geometry: None },
        }
    }

    pub fn is_nec(&self) -> bool {
        matches!(self.flavor, HdFlavor::Nec { .. })
    }

    fn extension(&self) -> String {
        self.unit
            .medium
            .filename()
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Bind the backing image and derive the geometry
    pub fn open(&mut self) -> Result<(), ImageError> {
        match self.flavor {
            HdFlavor::Standard => self.open_standard(),
            HdFlavor::Nec { .. } => self.open_nec(),
        }?;

        let capacity = self.unit.medium.block_count() << self.unit.medium.sector_shift();
        let mut product = format!("SCSI HD {}", format_capacity(capacity));
        product.truncate(16);
        self.unit.state.set_product(&product, false);

        self.unit.medium.validate(&mut self.unit.state)?;
        info!(
            blocks = self.unit.medium.block_count(),
            sector_size = self.unit.medium.sector_size(),
            "hard disk image opened"
        );
        Ok(())
    }

    fn open_standard(&mut self) -> Result<(), ImageError> {
        if self.extension() == "hd1" {
            self.unit.state.set_scsi_level(scsi_level::SCSI_1_CCS);
        }
        if let Some(size) = self.unit.medium.configured_sector_size() {
            self.unit.medium.set_sector_size(size)?;
        }
        self.unit.medium.bind_plain_file()
    }

    fn open_nec(&mut self) -> Result<(), ImageError> {
        let size = self.unit.medium.file_size()?;
        if size < 512 {
            return Err(ImageError::FileTooSmall {
                path: self
                    .unit
                    .medium
                    .filename()
                    .map(std::path::Path::to_path_buf)
                    .unwrap_or_default(),
                size,
                minimum: 512,
            });
        }

        let layout = match self.extension().as_str() {
            "hdn" => NecLayout {
                image_offset: 0,
                sector_size: 512,
                block_count: size / 512,
                geometry: None,
            },
            "hdi" => self.parse_hdi_header()?,
            "nhd" => self.parse_nhd_header()?,
            other => {
                return Err(ImageError::InvalidFormat(format!(
                    "unsupported NEC image extension: .{other}"
                )))
            }
        };

        if !HD_SECTOR_SIZES.contains(&layout.sector_size) {
            return Err(ImageError::UnsupportedSectorSize(layout.sector_size));
        }
        if layout.block_count == 0 {
            return Err(ImageError::NoCapacity);
        }
        if layout.image_offset + layout.block_count * u64::from(layout.sector_size) > size {
            return Err(ImageError::InvalidFormat(
                "image offset and size exceed the file".to_string(),
            ));
        }

        self.unit.medium.set_sector_size(layout.sector_size)?;
        self.unit.medium.set_block_count(layout.block_count);
        self.flavor = HdFlavor::Nec {
            geometry: layout.geometry,
        };
        self.unit
            .medium
            .bind_file(layout.image_offset, layout.sector_size, 0)
    }

    fn read_header(&self, len: usize) -> Result<Vec<u8>, ImageError> {
        let path = self
            .unit
            .medium
            .filename()
            .ok_or(ImageError::MissingFilename)?;
        let mut header = vec![0u8; len];
        File::open(path)?.read_exact(&mut header)?;
        Ok(header)
    }

    /// Anex86 .hdi header: little-endian fields for the image offset, image
    /// size, sector size and CHS geometry.
    fn parse_hdi_header(&self) -> Result<NecLayout, ImageError> {
        let header = self.read_header(32)?;
        let image_offset = u64::from(le_u32(&header, 8));
        let image_size = u64::from(le_u32(&header, 12));
        let sector_size = le_u32(&header, 16);
        let _sectors = le_u32(&header, 20);
        let heads = le_u32(&header, 24);
        let cylinders = le_u32(&header, 28);

        if sector_size == 0 {
            return Err(ImageError::UnsupportedSectorSize(0));
        }
        Ok(NecLayout {
            image_offset,
            sector_size,
            block_count: image_size / u64::from(sector_size),
            geometry: Some(NecGeometry {
                cylinders,
                heads: heads.min(255) as u8,
            }),
        })
    }

    /// T98Next .nhd header: signature plus little-endian geometry fields
    fn parse_nhd_header(&self) -> Result<NecLayout, ImageError> {
        let header = self.read_header(0x120)?;
        if &header[0..NHD_SIGNATURE.len()] != NHD_SIGNATURE {
            return Err(ImageError::InvalidFormat(
                "missing NHD signature".to_string(),
            ));
        }

        let image_offset = u64::from(le_u32(&header, 0x110));
        let cylinders = le_u32(&header, 0x114);
        let heads = le_u16(&header, 0x118);
        let sectors = le_u16(&header, 0x11A);
        let sector_size = u32::from(le_u16(&header, 0x11C));

        if !HD_SECTOR_SIZES.contains(&sector_size) {
            return Err(ImageError::UnsupportedSectorSize(sector_size));
        }
        Ok(NecLayout {
            image_offset,
            sector_size,
            block_count: u64::from(cylinders) * u64::from(heads) * u64::from(sectors),
            geometry: Some(NecGeometry {
                cylinders,
                heads: heads.min(255) as u8,
            }),
        })
    }

    pub fn inquiry_data(&self) -> Vec<u8> {
        let state = &self.unit.state;
        let mut inq = InquiryData::new(
            device_type::DIRECT_ACCESS,
            state.scsi_level(),
            state.is_removable(),
        );
        inq.set_identity(state.vendor(), state.product(), state.revision());
        inq.to_bytes().to_vec()
    }

    pub fn setup_mode_pages(&self, pages: &mut ModePages, page: u8, changeable: bool) {
        self.unit.add_base_pages(pages, page, changeable);

        match &self.flavor {
            HdFlavor::Standard => {
                if page == mode_page::DEC_SPECIAL || page == mode_page::ALL_PAGES {
                    self.add_dec_special_page(pages);
                }
            }
            HdFlavor::Nec { geometry } => {
                if page == mode_page::ERROR_RECOVERY || page == mode_page::ALL_PAGES {
                    self.add_nec_error_page(pages, changeable);
                }
                if page == mode_page::RIGID_GEOMETRY || page == mode_page::ALL_PAGES {
                    self.add_nec_drive_page(pages, changeable, *geometry);
                }
                if changeable {
                    if let Some(format) = pages.get_mut(&mode_page::FORMAT) {
                        // The NEC drive advertises a fully changeable sector size
                        set_u16(format, 12, 0xFFFF);
                    }
                }
            }
        }

        if page == mode_page::APPLE_VENDOR || page == mode_page::ALL_PAGES {
            mode_pages::add_apple_vendor_page(pages, changeable);
        }
    }

    fn add_dec_special_page(&self, pages: &mut ModePages) {
        let mut page = page_frame(mode_page::DEC_SPECIAL, 25);
        page[0] |= 0x80;
        // SSM (send shadow margin) enabled
        page[2] = 0x01;
        pages.insert(mode_page::DEC_SPECIAL, page);
    }

    fn add_nec_error_page(&self, pages: &mut ModePages, changeable: bool) {
        let mut page = page_frame(mode_page::ERROR_RECOVERY, 12);
        if !changeable {
            // PER/DTE/DCR retry behavior of the original drives
            page[2] = 0x26;
        }
        pages.insert(mode_page::ERROR_RECOVERY, page);
    }

    fn add_nec_drive_page(
        &self,
        pages: &mut ModePages,
        changeable: bool,
        geometry: Option<NecGeometry>,
    ) {
        let mut page = page_frame(mode_page::RIGID_GEOMETRY, 20);
        if !changeable && self.unit.state.is_ready() {
            let (cylinders, heads) = match geometry {
                Some(g) => (u64::from(g.cylinders), g.heads),
                None => (self.unit.medium.block_count() / (8 * 25), 8),
            };
            set_u24(&mut page, 2, cylinders.min(0xFF_FFFF) as u32);
            page[5] = heads;
        }
        pages.insert(mode_page::RIGID_GEOMETRY, page);
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            retroscsi_protocol::opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
            retroscsi_protocol::opcode::MODE_SENSE_6 => {
                let data = mode_pages::mode_sense6(
                    ctx.cdb,
                    self.unit.state.is_protected(),
                    self.unit.descriptor(),
                    |pages, page, changeable| self.setup_mode_pages(pages, page, changeable),
                )?;
                Ok(Response::DataIn(data))
            }
            retroscsi_protocol::opcode::MODE_SENSE_10 => {
                let data = mode_pages::mode_sense10(
                    ctx.cdb,
                    self.unit.state.is_protected(),
                    self.unit.descriptor(),
                    |pages, page, changeable| self.setup_mode_pages(pages, page, changeable),
                )?;
                Ok(Response::DataIn(data))
            }
            _ => self
                .unit
                .dispatch_block(ctx)
                .or_else(|| primary::dispatch_basic(&mut self.unit.state, ctx))
                .unwrap_or_else(|| Err(ScsiFault::invalid_command())),
        }
    }
}

#[derive(Debug)]
struct NecLayout {
    image_offset: u64,
    sector_size: u32,
    block_count: u64,
    geometry: Option<NecGeometry>,
}

fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Human-readable capacity with binary units
fn format_capacity(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    if bytes >= GIB {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{} KiB", bytes / 1024)
    }
}
