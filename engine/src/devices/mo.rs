//! Magneto-optical drive LUN.

use retroscsi_protocol::wire::{set_u16, set_u32, InquiryData};
use retroscsi_protocol::{device_type, mode_page, opcode, scsi_level};
use tracing::info;

use crate::devices::disk::DiskUnit;
use crate::devices::mode_pages::{self, page_frame, ModePages};
use crate::devices::primary;
use crate::devices::{CommandContext, Response};
use crate::error::{ImageError, ScsiFault};

/// Magneto-optical LUN
#[derive(Debug)]
pub struct OpticalMemory {
    pub unit: DiskUnit,
}

impl OpticalMemory {
    pub fn new(lun: u8) -> Self {
        let mut unit = DiskUnit::new(lun, scsi_level::SCSI_2, &[512, 1024, 2048, 4096]);
        unit.state.set_protectable(true);
        unit.state.set_removable(true);
        unit.state.set_lockable(true);
        unit.state.set_stoppable(true);
        unit.state.set_supports_save_parameters(true);
        unit.state.set_product("SCSI MO", true);
        Self { unit }
    }

    /// Bind the backing image as a plain sector stream
    pub fn open(&mut self) -> Result<(), ImageError> {
        if let Some(sector_size) = self.unit.medium.configured_sector_size() {
            self.unit.medium.set_sector_size(sector_size)?;
        }
        self.unit.medium.bind_plain_file()?;
        self.unit.medium.validate(&mut self.unit.state)?;
        info!(
            blocks = self.unit.medium.block_count(),
            sector_size = self.unit.medium.sector_size(),
            "MO image opened"
        );
        Ok(())
    }

    pub fn inquiry_data(&self) -> Vec<u8> {
        let state = &self.unit.state;
        let mut inq = InquiryData::new(device_type::OPTICAL_MEMORY, state.scsi_level(), true);
        inq.set_identity(state.vendor(), state.product(), state.revision());
        inq.to_bytes().to_vec()
    }

    pub fn setup_mode_pages(&self, pages: &mut ModePages, page: u8, changeable: bool) {
        self.unit.add_base_pages(pages, page, changeable);

        if page == mode_page::OPTICAL_MEMORY || page == mode_page::ALL_PAGES {
            pages.insert(
                mode_page::OPTICAL_MEMORY,
                page_frame(mode_page::OPTICAL_MEMORY, 4),
            );
        }
        if page == mode_page::VENDOR || page == mode_page::ALL_PAGES {
            self.add_vendor_page(pages, changeable);
        }
    }

    /// Vendor page 0x20 with the spare block and band layout of the known
    /// 3.5" MO geometries; other capacities report zeros.
    fn add_vendor_page(&self, pages: &mut ModePages, changeable: bool) {
        let mut page = page_frame(mode_page::VENDOR, 12);

        if !changeable && self.unit.state.is_ready() {
            let blocks = self.unit.medium.block_count();
            let (spare, bands) = match (self.unit.medium.sector_size(), blocks) {
                // 128 MB
                (512, 248_826) => (1024, 1),
                // 230 MB
                (512, 446_325) => (1025, 10),
                // 540 MB
                (512, 1_041_500) => (2250, 18),
                // 640 MB
                (2048, 310_352) => (2244, 11),
                // 1.3 GB
                (2048, 605_846) => (4437, 18),
                _ => (0, 0),
            };
            set_u32(&mut page, 4, blocks.min(u64::from(u32::MAX)) as u32);
            set_u16(&mut page, 8, spare);
            set_u16(&mut page, 10, bands);
        }

        pages.insert(mode_page::VENDOR, page);
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
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
