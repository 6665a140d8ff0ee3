//! Block command set and mode pages shared by all disk-like devices.

use retroscsi_protocol::wire::{
    get_u16, get_u32, get_u64, set_u16, set_u24, ReadCapacity10Data, ReadCapacity16Data,
};
use retroscsi_protocol::{asc, mode_page, opcode, sense_key};

use crate::devices::mode_pages::{self, page_frame, Descriptor, ModePages};
use crate::devices::primary;
use crate::devices::state::DeviceState;
use crate::devices::storage::StorageMedium;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;

/// Addressing mode of a block command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addressing {
    Rw6,
    Rw10,
    Rw16,
    Seek6,
    Seek10,
}

/// State and medium of a disk-like logical unit.
///
/// The concrete kinds (hard disk, CD-ROM, MO) embed this and add their own
/// open logic, INQUIRY data and mode pages.
#[derive(Debug)]
pub struct DiskUnit {
    pub state: DeviceState,
    pub medium: StorageMedium,
}

impl DiskUnit {
    pub fn new(lun: u8, scsi_level: u8, supported_sector_sizes: &[u32]) -> Self {
        Self {
            state: DeviceState::new(lun, scsi_level),
            medium: StorageMedium::new(supported_sector_sizes),
        }
    }

    fn check_ready(&self) -> Result<(), ScsiFault> {
        if !self.state.is_ready() {
            return Err(ScsiFault::not_ready());
        }
        Ok(())
    }

    /// Block descriptor content for MODE SENSE
    pub fn descriptor(&self) -> Descriptor {
        if self.state.is_ready() {
            Descriptor::Medium(Some((self.medium.block_count(), self.medium.sector_size())))
        } else {
            Descriptor::Medium(None)
        }
    }

    /// Decode and validate the LBA and transfer length of a block command.
    ///
    /// Returns `None` for a zero-length transfer, which completes without a
    /// data phase. A zero-capacity medium always reports LBA OUT OF RANGE.
    fn start_and_count(
        &self,
        cdb: &[u8],
        mode: Addressing,
    ) -> Result<Option<(u64, u32)>, ScsiFault> {
        let (start, count) = match mode {
            Addressing::Rw6 | Addressing::Seek6 => {
                let start = (u64::from(cdb[1] & 0x1F) << 16)
                    | (u64::from(cdb[2]) << 8)
                    | u64::from(cdb[3]);
                let count = if mode == Addressing::Rw6 {
                    // A length field of 0 means 256 blocks
                    if cdb[4] == 0 {
                        0x100
                    } else {
                        u32::from(cdb[4])
                    }
                } else {
                    0
                };
                (start, count)
            }
            Addressing::Rw10 | Addressing::Seek10 => {
                let count = if mode == Addressing::Seek10 {
                    0
                } else {
                    u32::from(get_u16(cdb, 7))
                };
                (u64::from(get_u32(cdb, 2)), count)
            }
            Addressing::Rw16 => (get_u64(cdb, 2), get_u32(cdb, 10)),
        };

        let capacity = self.medium.block_count();
        if capacity == 0 || start > capacity || start + u64::from(count) > capacity {
            return Err(ScsiFault::lba_out_of_range());
        }

        let seek = matches!(mode, Addressing::Seek6 | Addressing::Seek10);
        if count == 0 && !seek {
            return Ok(None);
        }
        Ok(Some((start, count)))
    }

    // ========================================================================
    // Block commands
    // ========================================================================

    fn test_unit_ready(&mut self) -> Result<Response, ScsiFault> {
        primary::check_attention(&mut self.state)?;
        if self.medium.is_medium_changed() {
            self.medium.set_medium_changed(false);
            if self.state.is_removable() {
                return Err(ScsiFault::not_ready_to_ready_change());
            }
        }
        if !self.state.is_ready() {
            return Err(ScsiFault::not_ready());
        }
        Ok(Response::Status)
    }

    fn read(&mut self, cdb: &[u8], mode: Addressing) -> Result<Response, ScsiFault> {
        let Some((start, count)) = self.start_and_count(cdb, mode)? else {
            return Ok(Response::Status);
        };
        let first = self.read_sector(start)?;
        Ok(Response::BlockRead {
            first,
            next: start + 1,
            blocks: count,
        })
    }

    /// Read one sector for the data-in loop
    pub fn read_sector(&mut self, lba: u64) -> Result<Vec<u8>, ScsiFault> {
        self.check_ready()?;
        if lba >= self.medium.block_count() {
            return Err(ScsiFault::lba_out_of_range());
        }
        self.medium
            .read_block(lba)
            .map_err(|_| ScsiFault::new(sense_key::MEDIUM_ERROR, asc::READ_ERROR))
    }

    fn write(&mut self, cdb: &[u8], mode: Addressing, verify: bool) -> Result<Response, ScsiFault> {
        let Some((start, count)) = self.start_and_count(cdb, mode)? else {
            return Ok(Response::Status);
        };
        self.check_ready()?;
        if !verify && self.state.is_protected() {
            return Err(ScsiFault::write_protected());
        }
        Ok(Response::BlockWrite {
            lba: start,
            chunk: self.medium.sector_size() as usize,
            blocks: count,
        })
    }

    /// Consume one sector of the data-out loop. VERIFY transfers are drained
    /// without touching the medium.
    pub fn write_sector(&mut self, cdb: &[u8], lba: u64, data: &[u8]) -> Result<(), ScsiFault> {
        if lba >= self.medium.block_count() {
            return Err(ScsiFault::lba_out_of_range());
        }
        if matches!(cdb[0], opcode::VERIFY_10 | opcode::VERIFY_16) {
            return Ok(());
        }
        self.medium
            .write_block(lba, data)
            .map_err(|_| ScsiFault::new(sense_key::MEDIUM_ERROR, asc::WRITE_FAULT))
    }

    fn seek(&mut self, cdb: &[u8], mode: Addressing) -> Result<Response, ScsiFault> {
        self.start_and_count(cdb, mode)?;
        self.check_ready()?;
        Ok(Response::Status)
    }

    fn rezero(&mut self) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        Ok(Response::Status)
    }

    fn reassign_blocks(&mut self) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        Ok(Response::Status)
    }

    fn format_unit(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        // FmtData with a parameter list is not supported
        if cdb[1] & 0x10 != 0 {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        Ok(Response::Status)
    }

    fn read_capacity10(&mut self) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        if self.medium.block_count() == 0 {
            return Err(ScsiFault::new(
                sense_key::ILLEGAL_REQUEST,
                asc::MEDIUM_NOT_PRESENT,
            ));
        }
        let data = ReadCapacity10Data::new(self.medium.block_count(), self.medium.sector_size());
        Ok(Response::DataIn(data.to_bytes().to_vec()))
    }

    fn read_capacity16(&mut self) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        if self.medium.block_count() == 0 {
            return Err(ScsiFault::new(
                sense_key::ILLEGAL_REQUEST,
                asc::MEDIUM_NOT_PRESENT,
            ));
        }
        let data = ReadCapacity16Data::new(self.medium.block_count(), self.medium.sector_size());
        Ok(Response::DataIn(data.to_bytes().to_vec()))
    }

    /// READ LONG / WRITE LONG: only a transfer length of 0 is supported.
    /// `length_offset` locates the 16-bit transfer length in the CDB.
    fn read_write_long(
        &mut self,
        cdb: &[u8],
        lba: u64,
        length_offset: usize,
    ) -> Result<Response, ScsiFault> {
        if lba > self.medium.block_count() {
            return Err(ScsiFault::lba_out_of_range());
        }
        if get_u16(cdb, length_offset) != 0 {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        Ok(Response::Status)
    }

    fn read_capacity16_read_long16(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        match cdb[1] & 0x1F {
            0x10 => self.read_capacity16(),
            0x11 => self.read_write_long(cdb, get_u64(cdb, 2), 12),
            _ => Err(ScsiFault::invalid_field_in_cdb()),
        }
    }

    fn synchronize_cache(&mut self) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        self.medium.flush();
        Ok(Response::Status)
    }

    fn read_defect_data(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        // No defect list; return an empty header
        let mut data = vec![0u8; 4];
        data.truncate(get_u16(cdb, 7) as usize);
        Ok(Response::DataIn(data))
    }

    fn prevent_allow_removal(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        self.check_ready()?;
        let prevent = cdb[4] & 0x01 != 0;
        if prevent && !self.state.is_lockable() {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        self.state.set_locked(prevent);
        Ok(Response::Status)
    }

    fn start_stop_unit(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let start = cdb[4] & 0x01 != 0;
        let load_eject = cdb[4] & 0x02 != 0;

        if !start {
            if load_eject {
                if !self.eject(false) {
                    return Err(ScsiFault::load_or_eject_failed());
                }
            } else {
                self.medium.flush();
                self.state.stop();
            }
        } else {
            self.state.start();
        }
        Ok(Response::Status)
    }

    fn mode_select_command(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        // Save-parameters bit
        if cdb[1] & 0x01 != 0 && !self.state.supports_save_parameters() {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        let length = if cdb[0] == opcode::MODE_SELECT_6 {
            cdb[4] as usize
        } else {
            get_u16(cdb, 7) as usize
        };
        Ok(Response::ParamOut { length })
    }

    /// Apply a received MODE SELECT parameter list
    pub fn mode_select(&mut self, cdb: &[u8], data: &[u8]) -> Result<(), ScsiFault> {
        let configurable = self.medium.is_sector_size_configurable();
        let medium = &mut self.medium;
        let mut try_sector_size = |size: u32| {
            if size == medium.sector_size() {
                return true;
            }
            configurable && medium.supports_sector_size(size) && medium.set_sector_size(size).is_ok()
        };
        mode_pages::mode_select(cdb, data, &mut try_sector_size)
    }

    /// Eject the medium: flush, drop the file binding, unblock the slot.
    /// The caller is responsible for releasing the backing-file reservation.
    pub fn eject(&mut self, force: bool) -> bool {
        if !self.state.eject(force) {
            return false;
        }
        self.medium.flush();
        self.medium.detach_file();
        true
    }

    // ========================================================================
    // Mode pages
    // ========================================================================

    /// Pages 1, 3, 4 and 8, common to every disk kind
    pub fn add_base_pages(&self, pages: &mut ModePages, page: u8, changeable: bool) {
        if page == mode_page::ERROR_RECOVERY || page == mode_page::ALL_PAGES {
            self.add_error_recovery_page(pages, changeable);
        }
        if page == mode_page::FORMAT || page == mode_page::ALL_PAGES {
            self.add_format_page(pages, changeable);
        }
        if page == mode_page::RIGID_GEOMETRY || page == mode_page::ALL_PAGES {
            self.add_drive_page(pages, changeable);
        }
        if page == mode_page::CACHING || page == mode_page::ALL_PAGES {
            self.add_cache_page(pages, changeable);
        }
    }

    fn add_error_recovery_page(&self, pages: &mut ModePages, _changeable: bool) {
        // Retry counts and recovery time limit stay at 0
        pages.insert(mode_page::ERROR_RECOVERY, page_frame(mode_page::ERROR_RECOVERY, 12));
    }

    fn add_format_page(&self, pages: &mut ModePages, changeable: bool) {
        let mut page = page_frame(mode_page::FORMAT, 24);
        // The format page is savable
        page[0] |= 0x80;

        if !changeable {
            // 8 tracks in one zone
            set_u16(&mut page, 2, 0x0008);
            // 25 sectors per track
            set_u16(&mut page, 10, 25);
            set_u16(&mut page, 12, self.medium.sector_size() as u16);
            // Interleave 1, track skew 11, cylinder skew 20
            set_u16(&mut page, 14, 1);
            set_u16(&mut page, 16, 11);
            set_u16(&mut page, 18, 20);
            // Hard-sectored
            page[20] = 0x40;
            if self.state.is_removable() {
                page[20] |= 0x20;
            }
        }

        pages.insert(mode_page::FORMAT, page);
        if changeable && self.medium.is_sector_size_configurable() {
            mode_pages::enrich_format_page(pages, changeable, self.medium.sector_size());
        }
    }

    fn add_drive_page(&self, pages: &mut ModePages, changeable: bool) {
        let mut page = page_frame(mode_page::RIGID_GEOMETRY, 24);

        if !changeable {
            if self.state.is_ready() {
                // Derived geometry: 8 heads, 25 sectors per track
                let cylinders = self.medium.block_count() / (8 * 25);
                set_u24(&mut page, 2, cylinders.min(0xFF_FFFF) as u32);
                page[5] = 8;
            }
            // 7200 rpm
            set_u16(&mut page, 20, 7200);
        }

        pages.insert(mode_page::RIGID_GEOMETRY, page);
    }

    fn add_cache_page(&self, pages: &mut ModePages, changeable: bool) {
        let mut page = page_frame(mode_page::CACHING, 12);

        if !changeable {
            // Pre-fetch transfer length, maximum pre-fetch and ceiling saturated
            set_u16(&mut page, 4, 0xFFFF);
            set_u16(&mut page, 8, 0xFFFF);
            set_u16(&mut page, 10, 0xFFFF);
        }

        pages.insert(mode_page::CACHING, page);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle the command set shared by all disk kinds. Returns `None` for
    /// opcodes the kind has to resolve itself.
    pub fn dispatch_block(
        &mut self,
        ctx: &CommandContext,
    ) -> Option<Result<Response, ScsiFault>> {
        let cdb = ctx.cdb;
        let result = match cdb[0] {
            opcode::TEST_UNIT_READY => self.test_unit_ready(),
            opcode::REZERO => self.rezero(),
            opcode::FORMAT_UNIT => self.format_unit(cdb),
            opcode::REASSIGN_BLOCKS => self.reassign_blocks(),
            opcode::READ_6 => self.read(cdb, Addressing::Rw6),
            opcode::READ_10 => self.read(cdb, Addressing::Rw10),
            opcode::READ_16 => self.read(cdb, Addressing::Rw16),
            opcode::WRITE_6 => self.write(cdb, Addressing::Rw6, false),
            opcode::WRITE_10 => self.write(cdb, Addressing::Rw10, false),
            opcode::WRITE_16 => self.write(cdb, Addressing::Rw16, false),
            opcode::VERIFY_10 => self.write(cdb, Addressing::Rw10, true),
            opcode::VERIFY_16 => self.write(cdb, Addressing::Rw16, true),
            opcode::SEEK_6 => self.seek(cdb, Addressing::Seek6),
            opcode::SEEK_10 => self.seek(cdb, Addressing::Seek10),
            opcode::READ_CAPACITY_10 => self.read_capacity10(),
            opcode::READ_LONG_10 => self.read_write_long(cdb, u64::from(get_u32(cdb, 2)), 7),
            opcode::WRITE_LONG_10 => self.read_write_long(cdb, u64::from(get_u32(cdb, 2)), 7),
            opcode::READ_CAPACITY_16_READ_LONG_16 => self.read_capacity16_read_long16(cdb),
            opcode::WRITE_LONG_16 => self.read_write_long(cdb, get_u64(cdb, 2), 12),
            opcode::SYNCHRONIZE_CACHE_10 | opcode::SYNCHRONIZE_CACHE_16 => {
                self.synchronize_cache()
            }
            opcode::READ_DEFECT_DATA_10 => self.read_defect_data(cdb),
            opcode::PREVENT_ALLOW_MEDIUM_REMOVAL => self.prevent_allow_removal(cdb),
            opcode::START_STOP_UNIT => self.start_stop_unit(cdb),
            opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10 => self.mode_select_command(cdb),
            _ => return None,
        };
        Some(result)
    }
}
