//! SCSI printer LUN spooling to a file and handing it to a host print
//! command.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use retroscsi_protocol::wire::{get_u24, InquiryData};
use retroscsi_protocol::{device_type, opcode, scsi_level};
use tracing::{info, warn};

use crate::devices::primary;
use crate::devices::state::DeviceState;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;

/// Largest PRINT transfer accepted in one command
const MAX_PRINT_TRANSFER: u32 = 4096;

/// Placeholder replaced by the spool path in the print command template
const FILE_PLACEHOLDER: &str = "%f";

/// Printer LUN
#[derive(Debug)]
pub struct Printer {
    pub state: DeviceState,
    print_cmd: String,
    timeout_secs: u32,
    spool: Option<Spool>,
    spool_counter: u32,
}

#[derive(Debug)]
struct Spool {
    path: PathBuf,
    file: File,
}

impl Printer {
    pub fn new(lun: u8) -> Self {
        let mut state = DeviceState::new(lun, scsi_level::SCSI_2);
        state.set_product("SCSI PRINTER", true);
        state.set_ready(true);
        state.set_supports_params(true);
        Self {
            state,
            print_cmd: "lp -oraw %f".to_string(),
            timeout_secs: 30,
            spool: None,
            spool_counter: 0,
        }
    }

    /// Configure the print command template. Must reference the spool file
    /// with `%f`.
    pub fn set_print_cmd(&mut self, cmd: &str) -> bool {
        if !cmd.contains(FILE_PLACEHOLDER) {
            return false;
        }
        self.print_cmd = cmd.to_string();
        true
    }

    /// Idle spool flush timeout in seconds
    pub fn set_timeout(&mut self, secs: u32) {
        self.timeout_secs = secs;
    }

    pub fn timeout(&self) -> u32 {
        self.timeout_secs
    }

    pub fn inquiry_data(&self) -> Vec<u8> {
        let mut inq = InquiryData::new(device_type::PRINTER, self.state.scsi_level(), false);
        inq.set_identity(self.state.vendor(), self.state.product(), self.state.revision());
        inq.to_bytes().to_vec()
    }

    fn print(&self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let length = get_u24(cdb, 2);
        if length > MAX_PRINT_TRANSFER {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        Ok(Response::ByteOut {
            length: length as usize,
        })
    }

    /// Append a received PRINT payload to the spool file
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), ScsiFault> {
        if self.spool.is_none() {
            let path = std::env::temp_dir().join(format!(
                "retroscsi-print-{}-{}",
                std::process::id(),
                self.spool_counter
            ));
            self.spool_counter += 1;
            let file = File::create(&path).map_err(|_| ScsiFault::aborted())?;
            self.spool = Some(Spool { path, file });
        }

        let spool = self.spool.as_mut().expect("spool was just created");
        spool.file.write_all(data).map_err(|_| ScsiFault::aborted())
    }

    /// Close the spool and hand it to the configured print command
    fn synchronize_buffer(&mut self) -> Result<Response, ScsiFault> {
        let Some(spool) = self.spool.take() else {
            // Nothing buffered, nothing to print
            return Err(ScsiFault::aborted());
        };
        drop(spool.file);

        let cmd = self
            .print_cmd
            .replace(FILE_PLACEHOLDER, &spool.path.to_string_lossy());
        info!(command = %cmd, "printing spool file");

        let result = Command::new("sh").arg("-c").arg(&cmd).status();
        let _ = std::fs::remove_file(&spool.path);

        match result {
            Ok(status) if status.success() => Ok(Response::Status),
            Ok(status) => {
                warn!(%status, "print command failed");
                Err(ScsiFault::aborted())
            }
            Err(error) => {
                warn!(%error, "print command could not be run");
                Err(ScsiFault::aborted())
            }
        }
    }

    /// Discard the spooled data
    fn stop_print(&mut self) -> Result<Response, ScsiFault> {
        if let Some(spool) = self.spool.take() {
            let _ = std::fs::remove_file(&spool.path);
        }
        Ok(Response::Status)
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            opcode::TEST_UNIT_READY => Ok(Response::Status),
            opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
            opcode::WRITE_6 => self.print(ctx.cdb),
            opcode::SYNCHRONIZE_BUFFER => self.synchronize_buffer(),
            // STOP PRINT shares the START STOP UNIT opcode
            opcode::START_STOP_UNIT => self.stop_print(),
            _ => primary::dispatch_basic(&mut self.state, ctx)
                .unwrap_or_else(|| Err(ScsiFault::invalid_command())),
        }
    }
}

impl Drop for Printer {
    fn drop(&mut self) {
        if let Some(spool) = self.spool.take() {
            let _ = std::fs::remove_file(&spool.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroscsi_protocol::{asc, sense_key};

    fn ctx<'a>(cdb: &'a [u8]) -> CommandContext<'a> {
        CommandContext {
            cdb,
            attached_luns: &[0],
            initiator: Some(7),
        }
    }

    fn cdb6(op: u8) -> [u8; 6] {
        let mut cdb = [0u8; 6];
        cdb[0] = op;
        cdb
    }

    #[test]
    fn test_print_cmd_validation() {
        let mut printer = Printer::new(0);
        assert!(!printer.set_print_cmd("missing_filename_specifier"));
        assert!(printer.set_print_cmd("%f"));
    }

    #[test]
    fn test_test_unit_ready() {
        let mut printer = Printer::new(0);
        assert!(matches!(
            printer.dispatch(&ctx(&cdb6(opcode::TEST_UNIT_READY))).unwrap(),
            Response::Status
        ));
    }

    #[test]
    fn test_inquiry() {
        let mut printer = Printer::new(0);
        let mut cdb = cdb6(opcode::INQUIRY);
        cdb[4] = 255;
        match printer.dispatch(&ctx(&cdb)).unwrap() {
            Response::DataIn(data) => {
                assert_eq!(device_type::PRINTER, data[0]);
                assert_eq!(0x00, data[1]);
                assert_eq!(b"RETRO   SCSI PRINTER    ", &data[8..32]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_reserve_release() {
        let mut printer = Printer::new(0);
        assert!(matches!(
            printer.dispatch(&ctx(&cdb6(opcode::RESERVE_6))).unwrap(),
            Response::Status
        ));
        assert!(matches!(
            printer.dispatch(&ctx(&cdb6(opcode::RELEASE_6))).unwrap(),
            Response::Status
        ));
    }

    #[test]
    fn test_print_stages_byte_transfer() {
        let mut printer = Printer::new(0);
        let mut cdb = cdb6(opcode::WRITE_6);
        cdb[4] = 0x10;
        assert!(matches!(
            printer.dispatch(&ctx(&cdb)).unwrap(),
            Response::ByteOut { length: 0x10 }
        ));

        cdb[3] = 0xFF;
        cdb[4] = 0xFF;
        let fault = printer.dispatch(&ctx(&cdb)).unwrap_err();
        assert_eq!(asc::INVALID_FIELD_IN_CDB, fault.asc);
    }

    #[test]
    fn test_synchronize_buffer_without_spool() {
        let mut printer = Printer::new(0);
        let fault = printer.dispatch(&ctx(&cdb6(opcode::SYNCHRONIZE_BUFFER))).unwrap_err();
        assert_eq!(sense_key::ABORTED_COMMAND, fault.sense_key);
    }

    #[test]
    fn test_spool_and_print() {
        let mut printer = Printer::new(0);
        // "true" accepts any arguments and succeeds
        assert!(printer.set_print_cmd("true %f"));

        printer.write_bytes(b"page 1").unwrap();
        printer.write_bytes(b" and page 2").unwrap();
        let spool_path = printer.spool.as_ref().unwrap().path.clone();
        assert!(spool_path.exists());

        assert!(matches!(
            printer.dispatch(&ctx(&cdb6(opcode::SYNCHRONIZE_BUFFER))).unwrap(),
            Response::Status
        ));
        assert!(!spool_path.exists(), "spool must be removed after printing");
        assert!(printer.spool.is_none());
    }

    #[test]
    fn test_failed_print_command_reports_aborted() {
        let mut printer = Printer::new(0);
        assert!(printer.set_print_cmd("false %f"));
        printer.write_bytes(b"data").unwrap();
        let fault = printer.dispatch(&ctx(&cdb6(opcode::SYNCHRONIZE_BUFFER))).unwrap_err();
        assert_eq!(sense_key::ABORTED_COMMAND, fault.sense_key);
    }

    #[test]
    fn test_stop_print_discards_spool() {
        let mut printer = Printer::new(0);
        printer.write_bytes(b"discarded").unwrap();
        let spool_path = printer.spool.as_ref().unwrap().path.clone();

        assert!(matches!(
            printer.dispatch(&ctx(&cdb6(opcode::START_STOP_UNIT))).unwrap(),
            Response::Status
        ));
        assert!(!spool_path.exists());
    }
}
