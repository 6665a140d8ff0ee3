//! Wire-format structures and big-endian field helpers.
//!
//! Response layouts a target serializes for the initiator. Each structure
//! mirrors the SCSI byte layout and serializes with `to_bytes`.

use crate::defs::{asc, scsi_level, sense_key};

// ============================================================================
// Big-Endian Field Access
// ============================================================================

/// Read a 16-bit big-endian value
pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read a 24-bit big-endian value
pub fn get_u24(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([0, buf[offset], buf[offset + 1], buf[offset + 2]])
}

/// Read a 32-bit big-endian value
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Read a 64-bit big-endian value
pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Write a 16-bit big-endian value
pub fn set_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Write a 24-bit big-endian value
pub fn set_u24(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 3].copy_from_slice(&value.to_be_bytes()[1..]);
}

/// Write a 32-bit big-endian value
pub fn set_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Write a 64-bit big-endian value
pub fn set_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

// ============================================================================
// Fixed-Format Sense Data
// ============================================================================

/// Fixed-format sense data (18 bytes)
#[derive(Debug, Clone, Copy, Default)]
pub struct SenseData {
    /// Response code (0x70 = current error)
    pub response_code: u8,
    /// Sense key, with flags in the high nibble
    pub sense_key: u8,
    /// Information bytes (command-specific)
    pub information: [u8; 4],
    /// Additional sense length (10 for fixed format)
    pub additional_length: u8,
    /// Command-specific information
    pub command_specific: [u8; 4],
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
    /// Field replaceable unit code
    pub fruc: u8,
    /// Sense key specific bytes
    pub sense_key_specific: [u8; 3],
}

impl SenseData {
    /// Size of fixed-format sense data
    pub const SIZE: usize = 18;

    /// Create sense data for a given error condition
    pub fn new(sense_key: u8, asc: u8) -> Self {
        Self {
            response_code: 0x70,
            sense_key,
            additional_length: 10,
            asc,
            ..Default::default()
        }
    }

    /// Create "not ready, medium not present" sense data
    pub fn medium_not_present() -> Self {
        Self::new(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT)
    }

    /// Serialize sense data to a buffer
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.response_code;
        buf[2] = self.sense_key;
        buf[3..7].copy_from_slice(&self.information);
        buf[7] = self.additional_length;
        buf[8..12].copy_from_slice(&self.command_specific);
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf[14] = self.fruc;
        buf[15..18].copy_from_slice(&self.sense_key_specific);
        buf
    }
}

// ============================================================================
// INQUIRY Data
// ============================================================================

/// Standard INQUIRY response data (36 bytes)
#[derive(Debug, Clone, Copy)]
pub struct InquiryData {
    /// Peripheral qualifier and device type
    pub peripheral: u8,
    /// Removable media bit (0x80)
    pub rmb: u8,
    /// ANSI version
    pub version: u8,
    /// Response data format
    pub response_format: u8,
    /// Additional length (31 for the standard 36-byte response)
    pub additional_length: u8,
    /// Vendor identification (8 bytes, space-padded)
    pub vendor: [u8; 8],
    /// Product identification (16 bytes, space-padded)
    pub product: [u8; 16],
    /// Product revision (4 bytes, space-padded)
    pub revision: [u8; 4],
}

impl InquiryData {
    /// Standard size of an INQUIRY response
    pub const SIZE: usize = 36;

    /// Create an INQUIRY response for a device.
    ///
    /// The response data format is capped at SCSI-2 for later standards, as
    /// the layout did not change past it.
    pub fn new(device_type: u8, level: u8, removable: bool) -> Self {
        Self {
            peripheral: device_type,
            rmb: if removable { 0x80 } else { 0x00 },
            version: level,
            response_format: level.min(scsi_level::SCSI_2),
            additional_length: (Self::SIZE - 5) as u8,
            vendor: *b"        ",
            product: *b"                ",
            revision: *b"    ",
        }
    }

    /// Set the vendor/product/revision strings, space-padded and truncated
    pub fn set_identity(&mut self, vendor: &str, product: &str, revision: &str) {
        copy_padded(&mut self.vendor, vendor);
        copy_padded(&mut self.product, product);
        copy_padded(&mut self.revision, revision);
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.peripheral;
        buf[1] = self.rmb;
        buf[2] = self.version;
        buf[3] = self.response_format;
        buf[4] = self.additional_length;
        buf[8..16].copy_from_slice(&self.vendor);
        buf[16..32].copy_from_slice(&self.product);
        buf[32..36].copy_from_slice(&self.revision);
        buf
    }
}

fn copy_padded(dest: &mut [u8], src: &str) {
    dest.fill(b' ');
    let bytes = src.as_bytes();
    let len = bytes.len().min(dest.len());
    dest[..len].copy_from_slice(&bytes[..len]);
}

// ============================================================================
// READ CAPACITY Data
// ============================================================================

/// READ CAPACITY(10) response (8 bytes)
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadCapacity10Data {
    /// Last logical block address (big-endian)
    pub last_lba: [u8; 4],
    /// Block length in bytes (big-endian)
    pub block_length: [u8; 4],
}

impl ReadCapacity10Data {
    /// Size of the READ CAPACITY(10) response
    pub const SIZE: usize = 8;

    /// Create from the block count and sector size.
    ///
    /// The last LBA saturates at 0xFFFFFFFF for media past the 32-bit limit.
    pub fn new(block_count: u64, sector_size: u32) -> Self {
        let last_lba = block_count.saturating_sub(1).min(u64::from(u32::MAX)) as u32;
        Self {
            last_lba: last_lba.to_be_bytes(),
            block_length: sector_size.to_be_bytes(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.last_lba);
        buf[4..8].copy_from_slice(&self.block_length);
        buf
    }
}

/// READ CAPACITY(16) response (32 bytes)
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadCapacity16Data {
    /// Last logical block address (big-endian)
    pub last_lba: [u8; 8],
    /// Block length in bytes (big-endian)
    pub block_length: [u8; 4],
}

impl ReadCapacity16Data {
    /// Size of the READ CAPACITY(16) response
    pub const SIZE: usize = 32;

    /// Create from the block count and sector size
    pub fn new(block_count: u64, sector_size: u32) -> Self {
        Self {
            last_lba: block_count.saturating_sub(1).to_be_bytes(),
            block_length: sector_size.to_be_bytes(),
        }
    }

    /// Serialize to bytes; bytes past the block length are reserved zeros
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.last_lba);
        buf[8..12].copy_from_slice(&self.block_length);
        buf
    }
}

// ============================================================================
// Table of Contents (READ TOC)
// ============================================================================

/// TOC track descriptor for READ TOC
#[derive(Debug, Clone, Copy, Default)]
pub struct TocEntry {
    /// ADR and control bits
    pub adr_control: u8,
    /// Track number
    pub track_number: u8,
    /// Track start address (LBA, big-endian)
    pub start_address: [u8; 4],
}

impl TocEntry {
    /// Create a data track entry
    pub fn data_track(track_number: u8, start_lba: u32) -> Self {
        Self {
            adr_control: 0x14, // ADR=1 (Q sub-channel), Control=4 (data track)
            track_number,
            start_address: start_lba.to_be_bytes(),
        }
    }

    /// Create a lead-out entry (track AA)
    pub fn lead_out(total_blocks: u32) -> Self {
        Self {
            adr_control: 0x14,
            track_number: 0xAA,
            start_address: total_blocks.to_be_bytes(),
        }
    }
}

/// Single-track TOC for a data CD
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleToc {
    /// Track 1 entry
    pub track1: TocEntry,
    /// Lead-out entry
    pub lead_out: TocEntry,
}

impl SimpleToc {
    /// Size of the serialized TOC: 4-byte header plus two 8-byte entries
    pub const SIZE: usize = 20;

    /// Create a TOC for a data CD with the given total block count
    pub fn new(total_blocks: u32) -> Self {
        Self {
            track1: TocEntry::data_track(1, 0),
            lead_out: TocEntry::lead_out(total_blocks),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        // TOC data length excludes the length field itself
        set_u16(&mut buf, 0, (Self::SIZE - 2) as u16);
        buf[2] = 1; // first track
        buf[3] = 1; // last track
        for (offset, entry) in [(4, &self.track1), (12, &self.lead_out)] {
            buf[offset + 1] = entry.adr_control;
            buf[offset + 2] = entry.track_number;
            buf[offset + 4..offset + 8].copy_from_slice(&entry.start_address);
        }
        buf
    }
}
