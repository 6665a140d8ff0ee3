//! SCSI constants (SPC-2 / SBC / MMC-2).
//!
//! Grouped constant modules for the byte values a target exchanges with the
//! initiator. Values are plain `u8`s rather than enums because they travel
//! in CDBs and response buffers as raw bytes.

// ============================================================================
// SCSI Command Opcodes
// ============================================================================

/// SCSI command opcodes dispatched by the target
pub mod opcode {
    /// Test if the logical unit is ready
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// Seek to track 0
    pub const REZERO: u8 = 0x01;
    /// Request sense data from the previous command
    pub const REQUEST_SENSE: u8 = 0x03;
    /// Format the medium
    pub const FORMAT_UNIT: u8 = 0x04;
    /// Reassign defective blocks
    pub const REASSIGN_BLOCKS: u8 = 0x07;
    /// Read data (6-byte CDB); GET MESSAGE for the DaynaPort
    pub const READ_6: u8 = 0x08;
    /// Retrieve statistics (DaynaPort vendor command)
    pub const RETRIEVE_STATS: u8 = 0x09;
    /// Write data (6-byte CDB); PRINT for printers, SEND MESSAGE for the DaynaPort
    pub const WRITE_6: u8 = 0x0A;
    /// Seek to logical block address (6-byte CDB)
    pub const SEEK_6: u8 = 0x0B;
    /// Set interface mode (DaynaPort vendor command)
    pub const SET_IFACE_MODE: u8 = 0x0C;
    /// Set multicast address (DaynaPort vendor command)
    pub const SET_MCAST_ADDR: u8 = 0x0D;
    /// Enable or disable the interface (DaynaPort vendor command)
    pub const ENABLE_INTERFACE: u8 = 0x0E;
    /// Flush the print buffer (printer)
    pub const SYNCHRONIZE_BUFFER: u8 = 0x10;
    /// Return device identification
    pub const INQUIRY: u8 = 0x12;
    /// Set mode parameters (6-byte CDB)
    pub const MODE_SELECT_6: u8 = 0x15;
    /// Reserve the logical unit
    pub const RESERVE_6: u8 = 0x16;
    /// Release the logical unit
    pub const RELEASE_6: u8 = 0x17;
    /// Return mode parameters (6-byte CDB)
    pub const MODE_SENSE_6: u8 = 0x1A;
    /// Start or stop the unit; STOP PRINT for printers
    pub const START_STOP_UNIT: u8 = 0x1B;
    /// Run a self test
    pub const SEND_DIAGNOSTIC: u8 = 0x1D;
    /// Prevent or allow medium removal
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    /// Return logical block address capacity
    pub const READ_CAPACITY_10: u8 = 0x25;
    /// Read data (10-byte CDB)
    pub const READ_10: u8 = 0x28;
    /// Write data (10-byte CDB)
    pub const WRITE_10: u8 = 0x2A;
    /// Seek to logical block address (10-byte CDB)
    pub const SEEK_10: u8 = 0x2B;
    /// Verify data (10-byte CDB)
    pub const VERIFY_10: u8 = 0x2F;
    /// Flush the cache (10-byte CDB)
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    /// Read defect data (10-byte CDB)
    pub const READ_DEFECT_DATA_10: u8 = 0x37;
    /// Read a block including ECC data
    pub const READ_LONG_10: u8 = 0x3E;
    /// Write a block including ECC data
    pub const WRITE_LONG_10: u8 = 0x3F;
    /// Read the table of contents (CD-ROM)
    pub const READ_TOC: u8 = 0x43;
    /// Set mode parameters (10-byte CDB)
    pub const MODE_SELECT_10: u8 = 0x55;
    /// Return mode parameters (10-byte CDB)
    pub const MODE_SENSE_10: u8 = 0x5A;
    /// Read data (16-byte CDB)
    pub const READ_16: u8 = 0x88;
    /// Write data (16-byte CDB)
    pub const WRITE_16: u8 = 0x8A;
    /// Verify data (16-byte CDB)
    pub const VERIFY_16: u8 = 0x8F;
    /// Flush the cache (16-byte CDB)
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    /// READ CAPACITY(16) or READ LONG(16), selected by the service action
    pub const READ_CAPACITY_16_READ_LONG_16: u8 = 0x9E;
    /// Write a block including ECC data (16-byte CDB)
    pub const WRITE_LONG_16: u8 = 0x9F;
    /// Report attached logical units
    pub const REPORT_LUNS: u8 = 0xA0;
}

// ============================================================================
// SCSI Status Codes
// ============================================================================

/// Status byte delivered in the status phase
pub mod status {
    /// Command completed successfully
    pub const GOOD: u8 = 0x00;
    /// Check condition - sense data available
    pub const CHECK_CONDITION: u8 = 0x02;
    /// Condition met
    pub const CONDITION_MET: u8 = 0x04;
    /// Device busy
    pub const BUSY: u8 = 0x08;
    /// Intermediate status
    pub const INTERMEDIATE: u8 = 0x10;
    /// Reservation conflict
    pub const RESERVATION_CONFLICT: u8 = 0x18;
}

// ============================================================================
// Sense Key Codes
// ============================================================================

/// Sense key codes for error reporting
pub mod sense_key {
    /// No error
    pub const NO_SENSE: u8 = 0x00;
    /// Recovered error
    pub const RECOVERED_ERROR: u8 = 0x01;
    /// Device not ready
    pub const NOT_READY: u8 = 0x02;
    /// Medium error
    pub const MEDIUM_ERROR: u8 = 0x03;
    /// Hardware error
    pub const HARDWARE_ERROR: u8 = 0x04;
    /// Illegal request
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    /// Unit attention (media changed, reset, etc.)
    pub const UNIT_ATTENTION: u8 = 0x06;
    /// Data protect (write protected)
    pub const DATA_PROTECT: u8 = 0x07;
    /// Blank check
    pub const BLANK_CHECK: u8 = 0x08;
    /// Aborted command
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

// ============================================================================
// Additional Sense Codes (ASC)
// ============================================================================

/// Additional Sense Codes for detailed error information
pub mod asc {
    /// No additional sense information
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    /// Peripheral device write fault
    pub const WRITE_FAULT: u8 = 0x03;
    /// Unrecovered read error
    pub const READ_ERROR: u8 = 0x11;
    /// Invalid command operation code
    pub const INVALID_COMMAND: u8 = 0x20;
    /// Logical block address out of range
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    /// Invalid field in CDB
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    /// Logical unit not supported
    pub const INVALID_LUN: u8 = 0x25;
    /// Invalid field in the parameter list
    pub const INVALID_FIELD_IN_PARAMETER_LIST: u8 = 0x26;
    /// Medium is write protected
    pub const WRITE_PROTECTED: u8 = 0x27;
    /// Not ready to ready transition (medium may have changed)
    pub const NOT_READY_TO_READY_CHANGE: u8 = 0x28;
    /// Power on, reset, or bus device reset occurred
    pub const POWER_ON_OR_RESET: u8 = 0x29;
    /// Medium not present
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    /// Medium load or eject failed
    pub const LOAD_OR_EJECT_FAILED: u8 = 0x53;
}

// ============================================================================
// Peripheral Device Types
// ============================================================================

/// Peripheral device type codes reported by INQUIRY
pub mod device_type {
    /// Direct-access device (disk)
    pub const DIRECT_ACCESS: u8 = 0x00;
    /// Printer device
    pub const PRINTER: u8 = 0x02;
    /// Processor device
    pub const PROCESSOR: u8 = 0x03;
    /// CD-ROM device
    pub const CD_ROM: u8 = 0x05;
    /// Optical memory device (MO)
    pub const OPTICAL_MEMORY: u8 = 0x07;
    /// Communications device
    pub const COMMUNICATIONS: u8 = 0x09;
}

// ============================================================================
// SCSI Standard Levels
// ============================================================================

/// ANSI version codes reported by INQUIRY
pub mod scsi_level {
    /// SCSI-1 with Common Command Set
    pub const SCSI_1_CCS: u8 = 0x01;
    /// SCSI-2 compliant
    pub const SCSI_2: u8 = 0x02;
    /// SPC compliant
    pub const SPC: u8 = 0x03;
    /// SPC-2 compliant
    pub const SPC_2: u8 = 0x04;
    /// SPC-3 compliant
    pub const SPC_3: u8 = 0x05;
}

// ============================================================================
// Message Bytes
// ============================================================================

/// Message bytes exchanged in the message phases
pub mod message {
    /// Command complete
    pub const COMMAND_COMPLETE: u8 = 0x00;
    /// Extended message follows
    pub const EXTENDED_MESSAGE: u8 = 0x01;
    /// Abort the current command
    pub const ABORT: u8 = 0x06;
    /// Last message was not supported
    pub const MESSAGE_REJECT: u8 = 0x07;
    /// Reset the addressed device
    pub const BUS_DEVICE_RESET: u8 = 0x0C;
    /// IDENTIFY base value; the low 5 bits carry the LUN
    pub const IDENTIFY: u8 = 0x80;
    /// SDTR extended message sub-code
    pub const EXTENDED_SDTR: u8 = 0x01;
}

// ============================================================================
// Mode Page Codes
// ============================================================================

/// Mode page codes for MODE SENSE/SELECT
pub mod mode_page {
    /// Read/Write error recovery
    pub const ERROR_RECOVERY: u8 = 0x01;
    /// Format device
    pub const FORMAT: u8 = 0x03;
    /// Rigid disk drive geometry
    pub const RIGID_GEOMETRY: u8 = 0x04;
    /// Optical memory
    pub const OPTICAL_MEMORY: u8 = 0x06;
    /// Caching
    pub const CACHING: u8 = 0x08;
    /// CD-ROM device parameters
    pub const CD_PARAMETERS: u8 = 0x0D;
    /// CD-ROM audio control
    pub const CD_AUDIO: u8 = 0x0E;
    /// Vendor page used by MO drives and the host services device
    pub const VENDOR: u8 = 0x20;
    /// DEC special function control
    pub const DEC_SPECIAL: u8 = 0x25;
    /// Apple vendor page
    pub const APPLE_VENDOR: u8 = 0x30;
    /// Return all mode pages
    pub const ALL_PAGES: u8 = 0x3F;
}

// ============================================================================
// CDB Sizing
// ============================================================================

/// Full CDB length in bytes for an opcode, derived from its group code.
///
/// Returns 0 for the reserved and vendor-specific groups the target does not
/// decode; the controller treats that as an unknown command.
pub fn command_byte_count(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        4 => 16,
        5 => 12,
        _ => 0,
    }
}
