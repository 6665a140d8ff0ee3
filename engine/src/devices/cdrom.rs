//! CD-ROM LUN backed by ISO or raw mode-1 track images.

use std::fs::File;
use std::io::Read;

use retroscsi_protocol::wire::{get_u16, get_u32, InquiryData, SimpleToc};
use retroscsi_protocol::{device_type, mode_page, opcode, scsi_level};
use tracing::info;

use crate::devices::disk::DiskUnit;
use crate::devices::mode_pages::{self, page_frame, ModePages};
use crate::devices::primary;
use crate::devices::{CommandContext, Response};
use crate::error::{ImageError, ScsiFault};

/// Stored bytes per sector of a raw mode-1 track; the 2048-byte payload
/// follows a 16-byte sync/address header.
const RAW_SECTOR_STRIDE: u32 = 2536;
const RAW_HEADER_LEN: u32 = 16;

/// Sync pattern opening every raw mode-1 sector
const RAW_SYNC: [u8; 12] = [
    0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
];

/// CD-ROM LUN
#[derive(Debug)]
pub struct CdRom {
    pub unit: DiskUnit,
    raw: bool,
}

impl CdRom {
    pub fn new(lun: u8) -> Self {
        let mut unit = DiskUnit::new(lun, scsi_level::SCSI_2, &[512, 2048]);
        unit.medium.set_sector_shift(11);
        unit.state.set_read_only(true);
        unit.state.set_removable(true);
        unit.state.set_lockable(true);
        unit.state.set_stoppable(true);
        unit.state.set_product("SCSI CD-ROM", true);
        Self { unit, raw: false }
    }

    fn extension(&self) -> String {
        self.unit
            .medium
            .filename()
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Bind an ISO 9660 or raw mode-1 image
    pub fn open(&mut self) -> Result<(), ImageError> {
        let path = self
            .unit
            .medium
            .filename()
            .ok_or(ImageError::MissingFilename)?
            .to_path_buf();
        if path.to_string_lossy().starts_with('\\') {
            return Err(ImageError::InvalidFormat(
                "physical drive paths are not supported".to_string(),
            ));
        }
        if self.extension() == "is1" {
            self.unit.state.set_scsi_level(scsi_level::SCSI_1_CCS);
        }

        let size = self.unit.medium.file_size()?;
        let mut header = [0u8; 16];
        let read = File::open(&path)?.read(&mut header)?;

        if read >= 4 && &header[0..4] == b"FILE" {
            return Err(ImageError::InvalidFormat(
                "CUE sheets are not supported".to_string(),
            ));
        }

        if read == 16 && header[0..12] == RAW_SYNC {
            // Raw track: byte 15 of the sector header carries the mode
            if header[15] != 0x01 {
                return Err(ImageError::InvalidFormat(
                    "raw image is not a mode 1 track".to_string(),
                ));
            }
            self.raw = true;
            self.unit.medium.set_sector_size(2048)?;
            self.unit
                .medium
                .set_block_count(size / u64::from(RAW_SECTOR_STRIDE));
            self.unit
                .medium
                .bind_file(0, RAW_SECTOR_STRIDE, RAW_HEADER_LEN)?;
        } else {
            self.raw = false;
            if let Some(sector_size) = self.unit.medium.configured_sector_size() {
                self.unit.medium.set_sector_size(sector_size)?;
            }
            self.unit.medium.bind_plain_file()?;
        }

        if self.unit.medium.block_count() == 0 {
            return Err(ImageError::NoCapacity);
        }
        self.unit.medium.validate(&mut self.unit.state)?;
        info!(
            blocks = self.unit.medium.block_count(),
            raw = self.raw,
            "CD-ROM image opened"
        );
        Ok(())
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// READ TOC for the single data track
    fn read_toc(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        if !self.unit.state.is_ready() || self.unit.medium.block_count() == 0 {
            return Err(ScsiFault::not_ready());
        }

        let blocks = self.unit.medium.block_count().min(u64::from(u32::MAX)) as u32;
        let mut data = SimpleToc::new(blocks).to_bytes().to_vec();

        // MSF addressing on request
        if cdb[1] & 0x02 != 0 {
            for offset in [8, 16] {
                let lba = get_u32(&data, offset) + 150;
                data[offset] = 0;
                data[offset + 1] = (lba / (75 * 60)) as u8;
                data[offset + 2] = ((lba / 75) % 60) as u8;
                data[offset + 3] = (lba % 75) as u8;
            }
        }

        data.truncate(get_u16(cdb, 7) as usize);
        Ok(Response::DataIn(data))
    }

    pub fn inquiry_data(&self) -> Vec<u8> {
        let state = &self.unit.state;
        let mut inq = InquiryData::new(device_type::CD_ROM, state.scsi_level(), true);
        inq.set_identity(state.vendor(), state.product(), state.revision());
        inq.to_bytes().to_vec()
    }

    pub fn setup_mode_pages(&self, pages: &mut ModePages, page: u8, changeable: bool) {
        self.unit.add_base_pages(pages, page, changeable);

        if page == mode_page::CD_PARAMETERS || page == mode_page::ALL_PAGES {
            let mut cd = page_frame(mode_page::CD_PARAMETERS, 8);
            if !changeable {
                // 2 second inactivity timer, MSF multiples of 60 and 75
                cd[3] = 0x05;
                cd[5] = 60;
                cd[7] = 75;
            }
            pages.insert(mode_page::CD_PARAMETERS, cd);
        }
        if page == mode_page::CD_AUDIO || page == mode_page::ALL_PAGES {
            pages.insert(mode_page::CD_AUDIO, page_frame(mode_page::CD_AUDIO, 16));
        }
        if page == mode_page::APPLE_VENDOR || page == mode_page::ALL_PAGES {
            mode_pages::add_apple_vendor_page(pages, changeable);
        }
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
            opcode::READ_TOC => self.read_toc(ctx.cdb),
            opcode::MODE_SENSE_6 => {
                let data = mode_pages::mode_sense6(
                    ctx.cdb,
                    self.unit.state.is_protected(),
                    self.unit.descriptor(),
                    |pages, page, changeable| self.setup_mode_pages(pages, page, changeable),
                )?;
                Ok(Response::DataIn(data))
            }
            opcode::MODE_SENSE_10 => {
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
