//! Host services LUN: realtime clock and shutdown control for the host the
//! emulator runs on.

use chrono::{Datelike, Local, Timelike};
use retroscsi_protocol::wire::{get_u16, InquiryData};
use retroscsi_protocol::{device_type, mode_page, opcode, scsi_level};

use crate::devices::mode_pages::{self, page_frame, Descriptor, ModePages};
use crate::devices::primary;
use crate::devices::state::DeviceState;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;
use crate::ShutdownMode;

/// Processor LUN exposing the host clock and shutdown requests
#[derive(Debug)]
pub struct HostServices {
    pub state: DeviceState,
}

impl HostServices {
    pub fn new(lun: u8) -> Self {
        let mut state = DeviceState::new(lun, scsi_level::SPC_3);
        state.set_product("Host Services", true);
        state.set_ready(true);
        Self { state }
    }

    pub fn inquiry_data(&self) -> Vec<u8> {
        let mut inq = InquiryData::new(device_type::PROCESSOR, self.state.scsi_level(), false);
        inq.set_identity(self.state.vendor(), self.state.product(), self.state.revision());
        inq.to_bytes().to_vec()
    }

    /// START STOP UNIT repurposes the START/LOEJ bits as shutdown requests
    fn start_stop_unit(&self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let start = cdb[4] & 0x01 != 0;
        let load_eject = cdb[4] & 0x02 != 0;

        let mode = match (start, load_eject) {
            (false, false) => ShutdownMode::StopEmulator,
            (false, true) => ShutdownMode::StopHost,
            (true, true) => ShutdownMode::RestartHost,
            (true, false) => return Err(ScsiFault::invalid_field_in_cdb()),
        };
        Ok(Response::Shutdown(mode))
    }

    /// Vendor page 0x20 carrying the current local time:
    /// `[code, 8, year-1900, month-1, day, hour, minute, second, 0, 0]`
    pub fn setup_mode_pages(&self, pages: &mut ModePages, page: u8, _changeable: bool) {
        if page != mode_page::VENDOR && page != mode_page::ALL_PAGES {
            return;
        }

        let now = Local::now();
        let mut body = page_frame(mode_page::VENDOR, 10);
        body[2] = (now.year() - 1900).clamp(0, 255) as u8;
        body[3] = (now.month0()) as u8;
        body[4] = now.day() as u8;
        body[5] = now.hour() as u8;
        body[6] = now.minute() as u8;
        body[7] = now.second() as u8;
        pages.insert(mode_page::VENDOR, body);
    }

    fn mode_select_command(&self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        if cdb[1] & 0x01 != 0 {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        let length = if cdb[0] == opcode::MODE_SELECT_6 {
            cdb[4] as usize
        } else {
            get_u16(cdb, 7) as usize
        };
        Ok(Response::ParamOut { length })
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            // Always answers, independent of any medium state
            opcode::TEST_UNIT_READY => Ok(Response::Status),
            opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
            opcode::START_STOP_UNIT => self.start_stop_unit(ctx.cdb),
            opcode::MODE_SENSE_6 => {
                let data = mode_pages::mode_sense6(
                    ctx.cdb,
                    false,
                    Descriptor::Unsupported,
                    |pages, page, changeable| self.setup_mode_pages(pages, page, changeable),
                )?;
                Ok(Response::DataIn(data))
            }
            opcode::MODE_SENSE_10 => {
                let data = mode_pages::mode_sense10(
                    ctx.cdb,
                    false,
                    Descriptor::Unsupported,
                    |pages, page, changeable| self.setup_mode_pages(pages, page, changeable),
                )?;
                Ok(Response::DataIn(data))
            }
            opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10 => self.mode_select_command(ctx.cdb),
            _ => primary::dispatch_basic(&mut self.state, ctx)
                .unwrap_or_else(|| Err(ScsiFault::invalid_command())),
        }
    }

    /// MODE SELECT data is not interpreted
    pub fn accept_parameters(&mut self, _cdb: &[u8], _data: &[u8]) -> Result<(), ScsiFault> {
        Err(ScsiFault::invalid_command())
    }
}
