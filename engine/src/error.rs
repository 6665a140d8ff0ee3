//! Error types of the target engine.
//!
//! `ScsiFault` is the command-level fault surfaced to the initiator as a
//! status byte plus sense data; it is raised deep inside command handlers and
//! propagated with `?` up to the controller, which is the single catch point.
//! `ImageError` covers the file layer underneath storage devices.

use std::io;
use std::path::PathBuf;

use retroscsi_protocol::{asc, sense_key, status};
use thiserror::Error;

/// A SCSI command fault: sense key, additional sense code and the status byte
/// reported to the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sense key {sense_key:#04x}, asc {asc:#04x}, status {status:#04x}")]
pub struct ScsiFault {
    pub sense_key: u8,
    pub asc: u8,
    pub status: u8,
}

impl ScsiFault {
    /// Fault reported as CHECK CONDITION
    pub fn new(sense_key: u8, asc: u8) -> Self {
        Self {
            sense_key,
            asc,
            status: status::CHECK_CONDITION,
        }
    }

    /// Override the status byte (e.g. RESERVATION CONFLICT)
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self
    }

    /// The unit is not ready and no medium is present
    pub fn not_ready() -> Self {
        Self::new(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT)
    }

    /// The opcode is not supported
    pub fn invalid_command() -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND)
    }

    /// A CDB field carries an unsupported value
    pub fn invalid_field_in_cdb() -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB)
    }

    /// A parameter list field carries an unsupported value
    pub fn invalid_field_in_parameter_list() -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARAMETER_LIST)
    }

    /// The addressed LUN is not attached
    pub fn invalid_lun() -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_LUN)
    }

    /// The logical block address is outside the medium
    pub fn lba_out_of_range() -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE)
    }

    /// The medium is write protected
    pub fn write_protected() -> Self {
        Self::new(sense_key::DATA_PROTECT, asc::WRITE_PROTECTED)
    }

    /// Load or eject was requested but cannot be performed
    pub fn load_or_eject_failed() -> Self {
        Self::new(sense_key::ILLEGAL_REQUEST, asc::LOAD_OR_EJECT_FAILED)
    }

    /// The command was aborted by the target
    pub fn aborted() -> Self {
        Self::new(sense_key::ABORTED_COMMAND, asc::NO_ADDITIONAL_SENSE)
    }

    /// Unit attention after a power-on or reset condition
    pub fn power_on_or_reset() -> Self {
        Self::new(sense_key::UNIT_ATTENTION, asc::POWER_ON_OR_RESET)
    }

    /// Unit attention after a not-ready to ready transition
    pub fn not_ready_to_ready_change() -> Self {
        Self::new(sense_key::UNIT_ATTENTION, asc::NOT_READY_TO_READY_CHANGE)
    }
}

/// Errors raised while binding or accessing a backing image file
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("no filename has been set")]
    MissingFilename,

    #[error("image file {0} does not exist")]
    FileNotFound(PathBuf),

    #[error("image file {path} is too small: {size} byte(s), expected at least {minimum}")]
    FileTooSmall {
        path: PathBuf,
        size: u64,
        minimum: u64,
    },

    #[error("drive has 0 blocks")]
    NoCapacity,

    #[error("unsupported sector size: {0} byte(s)")]
    UnsupportedSectorSize(u32),

    #[error("invalid image format: {0}")]
    InvalidFormat(String),

    #[error("image file {0} is already attached to another device")]
    FileInUse(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_defaults_to_check_condition() {
        let fault = ScsiFault::not_ready();
        assert_eq!(sense_key::NOT_READY, fault.sense_key);
        assert_eq!(asc::MEDIUM_NOT_PRESENT, fault.asc);
        assert_eq!(status::CHECK_CONDITION, fault.status);
    }

    #[test]
    fn test_with_status() {
        let fault = ScsiFault::aborted().with_status(status::RESERVATION_CONFLICT);
        assert_eq!(sense_key::ABORTED_COMMAND, fault.sense_key);
        assert_eq!(status::RESERVATION_CONFLICT, fault.status);
    }
}
