//! Controller owning the logical units of one target id.

pub mod manager;
mod phases;

use std::time::Instant;

use retroscsi_protocol::{status, Phase};
use tracing::{error, warn};

use crate::bus::Bus;
use crate::devices::{Device, InitiatorId};
use crate::ShutdownMode;

/// Maximum number of logical units behind one target id
pub const MAX_LUNS: usize = 32;

/// Minimum buffer size; large enough for the default sector size and a full
/// Ethernet frame with its header and checksum
const DEFAULT_BUFFER_SIZE: usize = 0x1000;
const ETH_FRAME_LEN: usize = 1514;
const ETH_FCS_LEN: usize = 4;

/// Minimum time between command receipt and the following information
/// transfer phase, in microseconds. Old initiators depend on this gap.
const MIN_EXEC_TIME_US: u64 = 50;

/// Synchronous transfer limits advertised in the SDTR reply
const MAX_SYNC_PERIOD: u8 = 50;
const MAX_SYNC_OFFSET: u8 = 16;

/// Transfer bookkeeping of the current command
#[derive(Debug)]
pub(crate) struct TransferState {
    /// Command descriptor block, grown to the decoded CDB length
    pub cmd: Vec<u8>,
    /// Status byte for the status phase
    pub status: u8,
    /// Message byte for the message phases
    pub message: u8,
    /// Data transfer buffer
    pub buffer: Vec<u8>,
    /// Remaining transfer blocks
    pub blocks: u32,
    /// Next logical block address
    pub next: u64,
    /// Current offset into the buffer
    pub offset: usize,
    /// Remaining byte count of the current chunk
    pub length: usize,
}

#[derive(Debug, Default)]
struct SyncState {
    enabled: bool,
    period: u8,
    offset: u8,
}

/// Controller for one target id, owning up to [`MAX_LUNS`] devices and the
/// bus phase state machine that serves them.
#[derive(Debug)]
pub struct Controller {
    target_id: u8,
    luns: Vec<Option<Device>>,
    phase: Phase,
    pub(crate) ctrl: TransferState,
    initiator_id: InitiatorId,
    identified_lun: Option<u8>,
    exec_start: Option<Instant>,
    sync: SyncState,
    /// Message-out bytes are being collected after selection with ATN
    atn_msg: bool,
    msg_bytes: Vec<u8>,
    byte_transfer: bool,
    bytes_to_transfer: usize,
    shutdown: ShutdownMode,
}

impl Controller {
    pub fn new(target_id: u8) -> Self {
        let mut luns = Vec::with_capacity(MAX_LUNS);
        luns.resize_with(MAX_LUNS, || None);
        Self {
            target_id,
            luns,
            phase: Phase::BusFree,
            ctrl: TransferState {
                cmd: vec![0; 16],
                status: status::GOOD,
                message: 0x00,
                buffer: vec![0; DEFAULT_BUFFER_SIZE.max(ETH_FRAME_LEN + 16 + ETH_FCS_LEN)],
                blocks: 0,
                next: 0,
                offset: 0,
                length: 0,
            },
            initiator_id: None,
            identified_lun: None,
            exec_start: None,
            sync: SyncState::default(),
            atn_msg: false,
            msg_bytes: Vec::new(),
            byte_transfer: false,
            bytes_to_transfer: 0,
            shutdown: ShutdownMode::None,
        }
    }

    pub fn target_id(&self) -> u8 {
        self.target_id
    }

    pub fn max_luns(&self) -> usize {
        MAX_LUNS
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn initiator_id(&self) -> InitiatorId {
        self.initiator_id
    }

    // ========================================================================
    // LUN management
    // ========================================================================

    /// Attach a device at its LUN. Fails for an out-of-range or occupied LUN.
    pub fn add_device(&mut self, device: Device) -> bool {
        let lun = device.lun() as usize;
        if lun >= MAX_LUNS || self.luns[lun].is_some() {
            return false;
        }
        self.luns[lun] = Some(device);
        true
    }

    /// Detach and return the device at `lun`
    pub fn remove_device(&mut self, lun: u8) -> Option<Device> {
        self.luns.get_mut(lun as usize).and_then(Option::take)
    }

    pub fn has_device(&self, lun: u8) -> bool {
        self.device(lun).is_some()
    }

    pub fn device(&self, lun: u8) -> Option<&Device> {
        self.luns.get(lun as usize).and_then(Option::as_ref)
    }

    pub fn device_mut(&mut self, lun: u8) -> Option<&mut Device> {
        self.luns.get_mut(lun as usize).and_then(Option::as_mut)
    }

    pub fn lun_count(&self) -> usize {
        self.luns.iter().filter(|lun| lun.is_some()).count()
    }

    /// Attached LUN numbers in ascending order
    pub fn attached_luns(&self) -> Vec<u8> {
        self.luns
            .iter()
            .enumerate()
            .filter_map(|(lun, device)| device.as_ref().map(|_| lun as u8))
            .collect()
    }

    /// Iterate over all attached devices
    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.luns.iter_mut().filter_map(Option::as_mut)
    }

    // ========================================================================
    // Controller state
    // ========================================================================

    /// Reset the transfer state and every attached LUN
    pub fn reset(&mut self) {
        self.phase = Phase::BusFree;
        self.ctrl.status = status::GOOD;
        self.ctrl.message = 0x00;
        self.ctrl.blocks = 0;
        self.ctrl.next = 0;
        self.ctrl.offset = 0;
        self.ctrl.length = 0;
        self.exec_start = None;
        self.identified_lun = None;
        self.atn_msg = false;
        self.msg_bytes.clear();
        self.sync.offset = 0;
        self.set_byte_transfer(false);

        for device in self.devices_mut() {
            device.reset();
        }
    }

    /// The LUN addressed by the current command: the IDENTIFY message wins,
    /// the CDB LUN field is the fallback.
    pub fn effective_lun(&self) -> u8 {
        self.identified_lun
            .unwrap_or((self.ctrl.cmd[1] >> 5) & 0x07)
    }

    /// Derive the initiator id from the DAT byte seen during selection:
    /// the highest bit set besides our own, or unknown if there is none.
    pub fn extract_initiator_id(&self, id_data: u8) -> InitiatorId {
        let others = id_data & !(1 << self.target_id);
        if others == 0 {
            None
        } else {
            Some(7 - others.leading_zeros() as u8)
        }
    }

    /// Grow the transfer buffer; never shrinks
    pub(crate) fn allocate_buffer(&mut self, size: usize) {
        if size > self.ctrl.buffer.len() {
            self.ctrl.buffer.resize(size, 0);
        }
    }

    /// Grow the CDB buffer; never shrinks
    pub(crate) fn allocate_cmd(&mut self, size: usize) {
        if size > self.ctrl.cmd.len() {
            self.ctrl.cmd.resize(size, 0);
        }
    }

    pub fn is_byte_transfer(&self) -> bool {
        self.byte_transfer
    }

    pub(crate) fn set_byte_transfer(&mut self, byte_transfer: bool) {
        self.byte_transfer = byte_transfer;
        if !byte_transfer {
            self.bytes_to_transfer = 0;
        }
    }

    /// Enable answering SDTR negotiation instead of rejecting it
    pub fn set_sync_transfer_enabled(&mut self, enabled: bool) {
        self.sync.enabled = enabled;
    }

    /// Record a shutdown request, honored at the next bus-free transition
    pub fn schedule_shutdown(&mut self, mode: ShutdownMode) {
        self.shutdown = mode;
    }

    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.shutdown
    }

    // ========================================================================
    // Processing
    // ========================================================================

    /// Run one step of the phase state machine.
    ///
    /// RST aborts everything and resets controller and bus. A fault escaping
    /// the phase logic resets likewise and returns to bus free.
    pub fn process(&mut self, bus: &mut dyn Bus, initiator: InitiatorId) -> Phase {
        bus.acquire();

        if bus.get_rst() {
            warn!("RESET signal received");
            self.reset();
            bus.reset();
            return self.phase;
        }

        self.initiator_id = initiator;

        if let Err(fault) = self.process_phase(bus) {
            error!(%fault, "unhandled SCSI error, resetting controller and bus");
            self.reset();
            bus.reset();
            self.bus_free_phase(bus);
        }

        self.phase
    }

    /// Drive a full transaction for a selection event until the bus is free
    /// again. `id_data` is the DAT byte latched at selection.
    pub fn process_transaction(&mut self, bus: &mut dyn Bus, id_data: u8) -> ShutdownMode {
        let initiator = self.extract_initiator_id(id_data);
        while !self.process(bus, initiator).is_bus_free() {}
        self.shutdown
    }

    fn process_phase(&mut self, bus: &mut dyn Bus) -> Result<(), crate::error::ScsiFault> {
        match self.phase {
            Phase::BusFree => self.bus_free_phase(bus),
            Phase::Selection => self.selection_phase(bus),
            Phase::DataOut => self.data_out_phase(bus),
            Phase::DataIn => self.data_in_phase(bus),
            Phase::Command => self.command_phase(bus),
            Phase::Status => self.status_phase(bus),
            Phase::MsgOut => self.msg_out_phase(bus),
            Phase::MsgIn => self.msg_in_phase(bus),
            // Arbitration, reselection and the reserved encodings are
            // terminal error states for a target
            _ => return Err(crate::error::ScsiFault::aborted()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Device, HardDisk, HostServices};
    use crate::testing::{SignalFrame, TestBus};
    use retroscsi_protocol::wire::get_u16;
    use retroscsi_protocol::{asc, message, opcode, sense_key};
    use std::io::Write;

    fn ready_hd(lun: u8, block_count: u64, sector_size: u32) -> Device {
        let mut hd = HardDisk::new(lun, false);
        hd.unit.medium.set_sector_size(sector_size).unwrap();
        hd.unit.medium.set_block_count(block_count);
        hd.unit.state.set_ready(true);
        Device::HardDisk(hd)
    }

    fn image_hd(lun: u8, sectors: usize) -> (tempfile::NamedTempFile, Device) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for lba in 0..sectors {
            file.write_all(&vec![0xD0 + lba as u8; 512]).unwrap();
        }
        let mut hd = HardDisk::new(lun, false);
        hd.unit.medium.set_filename(file.path());
        hd.open().unwrap();
        hd.unit.medium.set_medium_changed(false);
        (file, Device::HardDisk(hd))
    }

    fn set_cdb(controller: &mut Controller, cdb: &[u8]) {
        controller.allocate_cmd(cdb.len());
        controller.ctrl.cmd.fill(0);
        controller.ctrl.cmd[..cdb.len()].copy_from_slice(cdb);
    }

    #[test]
    fn test_extract_initiator_id() {
        let controller = Controller::new(1);
        assert_eq!(Some(7), controller.extract_initiator_id((1 << 7) | (1 << 1)));
        assert_eq!(None, controller.extract_initiator_id(1 << 1));
        assert_eq!(Some(0), controller.extract_initiator_id(0b0000_0011));
    }

    #[test]
    fn test_device_lun_lifecycle() {
        let mut controller = Controller::new(1);

        assert_eq!(0, controller.lun_count());
        assert!(controller.add_device(ready_hd(4, 0, 512)));
        assert!(
            !controller.add_device(ready_hd(32, 0, 512)),
            "LUN out of range"
        );
        assert!(!controller.add_device(ready_hd(4, 0, 512)), "duplicate LUN");
        assert_eq!(1, controller.lun_count());
        assert!(controller.has_device(4));
        assert!(!controller.has_device(0));

        assert!(controller.remove_device(4).is_some());
        assert_eq!(0, controller.lun_count());
        assert!(controller.remove_device(4).is_none());
    }

    #[test]
    fn test_reset_invariants() {
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));
        controller
            .device_mut(0)
            .unwrap()
            .state_mut()
            .set_locked(true);

        controller.set_phase(Phase::Status);
        controller.ctrl.status = status::CHECK_CONDITION;
        controller.ctrl.length = 5;
        controller.ctrl.blocks = 2;
        controller.ctrl.offset = 3;
        controller.set_byte_transfer(true);

        controller.reset();
        assert!(controller.phase().is_bus_free());
        assert_eq!(status::GOOD, controller.ctrl.status);
        assert_eq!(0, controller.ctrl.length);
        assert_eq!(0, controller.ctrl.blocks);
        assert_eq!(0, controller.ctrl.offset);
        assert!(!controller.is_byte_transfer());
        assert!(!controller.device(0).unwrap().state().is_locked());
    }

    #[test]
    fn test_effective_lun() {
        let mut controller = Controller::new(0);
        controller.ctrl.cmd[1] = 3 << 5;
        assert_eq!(3, controller.effective_lun());

        controller.identified_lun = Some(5);
        assert_eq!(5, controller.effective_lun());
    }

    #[test]
    fn test_buffer_allocation_grows_only() {
        let mut controller = Controller::new(0);
        let initial = controller.ctrl.buffer.len();
        controller.allocate_buffer(1);
        assert_eq!(initial, controller.ctrl.buffer.len());
        controller.allocate_buffer(initial + 1);
        assert_eq!(initial + 1, controller.ctrl.buffer.len());

        assert_eq!(16, controller.ctrl.cmd.len());
        controller.allocate_cmd(20);
        assert_eq!(20, controller.ctrl.cmd.len());
    }

    #[test]
    fn test_rst_resets_controller_and_bus() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.set_phase(Phase::Status);

        bus.set_rst_now(true);
        let phase = controller.process(&mut bus, Some(7));
        assert!(phase.is_bus_free());
        assert_eq!(1, bus.reset_count);
    }

    #[test]
    fn test_reserved_phase_is_terminal() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.set_phase(Phase::Reselection);

        let phase = controller.process(&mut bus, Some(7));
        assert!(phase.is_bus_free(), "reselection must reset to bus free");
        assert_eq!(1, bus.reset_count);
    }

    // ------------------------------------------------------------------------
    // Command execution
    // ------------------------------------------------------------------------

    #[test]
    fn test_unready_device_and_request_sense() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        let mut hd = HardDisk::new(0, false);
        hd.unit.medium.set_block_count(0x12345678);
        controller.add_device(Device::HardDisk(hd));

        set_cdb(&mut controller, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::CHECK_CONDITION, controller.ctrl.status);
        assert!(controller.phase().is_status());

        // The bus-free transition would reinitialize the status byte
        controller.ctrl.status = status::GOOD;
        controller.set_phase(Phase::BusFree);

        set_cdb(&mut controller, &[0x03, 0x00, 0x00, 0x00, 0xFF, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::GOOD, controller.ctrl.status);
        assert_eq!(18, controller.ctrl.length);
        assert_eq!(0x70, controller.ctrl.buffer[0]);
        assert_eq!(sense_key::NOT_READY, controller.ctrl.buffer[2]);
        assert_eq!(10, controller.ctrl.buffer[7]);
        assert_eq!(asc::MEDIUM_NOT_PRESENT, controller.ctrl.buffer[12]);
        assert_eq!(0x00, controller.ctrl.buffer[13]);
    }

    #[test]
    fn test_inquiry_short_allocation() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 0x12345678, 1024));

        set_cdb(&mut controller, &[0x12, 0x00, 0x00, 0x00, 0x01, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(1, controller.ctrl.length);
        assert_eq!(0x00, controller.ctrl.buffer[0], "direct-access device type");
    }

    #[test]
    fn test_report_luns() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));
        controller.add_device(ready_hd(4, 1, 512));

        set_cdb(
            &mut controller,
            &[0xA0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00],
        );
        controller.execute(&mut bus);

        assert_eq!(24, controller.ctrl.length);
        let buf = &controller.ctrl.buffer;
        assert_eq!([0x00, 0x00, 0x00, 0x10], buf[0..4]);
        assert_eq!([0x00, 0x00, 0x00, 0x00], buf[4..8]);
        assert_eq!([0x00; 8], buf[8..16]);
        assert_eq!([0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], buf[16..24]);
    }

    #[test]
    fn test_read_capacity10_bytes() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 0x12345678, 1024));

        set_cdb(
            &mut controller,
            &[0x25, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
        controller.execute(&mut bus);
        assert_eq!(8, controller.ctrl.length);
        assert_eq!(
            [0x12, 0x34, 0x56, 0x77, 0x00, 0x00, 0x04, 0x00],
            controller.ctrl.buffer[0..8]
        );
    }

    #[test]
    fn test_mode_sense6_format_page() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 0x12345678, 1024));

        set_cdb(&mut controller, &[0x1A, 0x00, 0x03, 0x00, 0xFF, 0x00]);
        controller.execute(&mut bus);

        let buf = &controller.ctrl.buffer;
        assert_eq!(0x08, buf[3], "block descriptor length");
        // Block descriptor: 1024 bytes per sector
        assert_eq!(0x04, buf[10]);
        assert_eq!(0x00, buf[11]);
        // Format page body behind header and descriptor
        assert_eq!(0x03, buf[12] & 0x3F);
        assert_eq!(25, get_u16(buf, 12 + 10), "sectors per track");
        assert_eq!(1024, get_u16(buf, 12 + 12), "bytes per sector");
        assert_eq!(11, get_u16(buf, 12 + 16), "track skew");
        assert_eq!(20, get_u16(buf, 12 + 18), "cylinder skew");
    }

    #[test]
    fn test_missing_lun_inquiry_reports_qualifier() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        set_cdb(&mut controller, &[0x12, 1 << 5, 0x00, 0x00, 0xFF, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(0x7F, controller.ctrl.buffer[0]);
        assert_eq!(status::GOOD, controller.ctrl.status);
    }

    #[test]
    fn test_missing_lun_rejects_other_commands() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        set_cdb(&mut controller, &[0x00, 1 << 5, 0x00, 0x00, 0x00, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::CHECK_CONDITION, controller.ctrl.status);
        assert_eq!(
            (sense_key::ILLEGAL_REQUEST, asc::INVALID_LUN),
            controller.device(0).unwrap().state().sense()
        );
    }

    #[test]
    fn test_missing_lun_request_sense_answers_from_lun0() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        set_cdb(&mut controller, &[0x03, 1 << 5, 0x00, 0x00, 0xFF, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::GOOD, controller.ctrl.status);
        assert_eq!(sense_key::ILLEGAL_REQUEST, controller.ctrl.buffer[2]);
        assert_eq!(asc::INVALID_LUN, controller.ctrl.buffer[12]);
    }

    #[test]
    fn test_reservation_conflict() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));
        controller
            .device_mut(0)
            .unwrap()
            .state_mut()
            .reserve(Some(1));

        controller.initiator_id = Some(2);
        set_cdb(&mut controller, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::RESERVATION_CONFLICT, controller.ctrl.status);

        // INQUIRY is exempt from the reservation
        controller.set_phase(Phase::BusFree);
        controller.ctrl.status = status::GOOD;
        set_cdb(&mut controller, &[0x12, 0x00, 0x00, 0x00, 0x24, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::GOOD, controller.ctrl.status);
    }

    #[test]
    fn test_host_services_shutdown_request() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(6);
        controller.add_device(Device::HostServices(HostServices::new(0)));

        set_cdb(&mut controller, &[0x1B, 0x00, 0x00, 0x00, 0x02, 0x00]);
        controller.execute(&mut bus);
        assert_eq!(status::GOOD, controller.ctrl.status);
        assert_eq!(ShutdownMode::StopHost, controller.shutdown_mode());

        // The request survives the bus-free transition that honors it
        controller.bus_free_phase(&mut bus);
        assert!(controller.phase().is_bus_free());
        assert_eq!(ShutdownMode::StopHost, controller.shutdown_mode());
    }

    #[test]
    fn test_error_during_status_frees_the_bus() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));

        controller.set_phase(Phase::Status);
        controller.error(&mut bus, crate::error::ScsiFault::aborted());
        assert!(controller.phase().is_bus_free());

        controller.set_phase(Phase::MsgIn);
        controller.error(&mut bus, crate::error::ScsiFault::aborted());
        assert!(controller.phase().is_bus_free());
    }

    #[test]
    fn test_error_records_sense_and_enters_status() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));

        controller.set_phase(Phase::Command);
        controller.error(
            &mut bus,
            crate::error::ScsiFault::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
        );
        assert!(controller.phase().is_status());
        assert_eq!(status::CHECK_CONDITION, controller.ctrl.status);
        assert_eq!(1, controller.ctrl.length);
        assert_eq!(
            (sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
            controller.device(0).unwrap().state().sense()
        );
    }

    // ------------------------------------------------------------------------
    // Full transactions over the scripted bus
    // ------------------------------------------------------------------------

    /// Selection with our id bit and the initiator's bit on DAT
    fn select(target_id: u8, initiator_id: u8) -> SignalFrame {
        SignalFrame {
            sel: true,
            dat: (1 << target_id) | (1 << initiator_id),
            ..Default::default()
        }
    }

    #[test]
    fn test_transaction_test_unit_ready() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        bus.cdbs.push_back(vec![0x00, 0, 0, 0, 0, 0]);

        let shutdown = controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));
        assert_eq!(ShutdownMode::None, shutdown);
        assert!(controller.phase().is_bus_free());

        // Status byte, then COMMAND COMPLETE
        assert_eq!(vec![vec![status::GOOD], vec![message::COMMAND_COMPLETE]], bus.sent);
    }

    #[test]
    fn test_transaction_inquiry() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        bus.cdbs.push_back(vec![0x12, 0, 0, 0, 36, 0]);

        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));

        assert_eq!(3, bus.sent.len());
        assert_eq!(36, bus.sent[0].len());
        assert_eq!(0x00, bus.sent[0][0]);
        assert_eq!(&b"RETRO   "[..], &bus.sent[0][8..16]);
        assert_eq!(vec![status::GOOD], bus.sent[1]);
        assert_eq!(vec![message::COMMAND_COMPLETE], bus.sent[2]);
    }

    #[test]
    fn test_transaction_identify_message_selects_lun() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));
        // LUN 1 exists but has no medium
        controller.add_device(Device::HardDisk(HardDisk::new(1, false)));

        bus.push_frame(select(4, 7));
        // Selection completes with ATN: one message byte follows
        bus.push_frame(SignalFrame {
            atn: true,
            ..Default::default()
        });
        bus.push_frame(SignalFrame::default());
        bus.data_out.push_back(vec![message::IDENTIFY | 1]);
        bus.cdbs.push_back(vec![0x00, 0, 0, 0, 0, 0]);

        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));

        // TEST UNIT READY went to LUN 1, which reported not ready
        assert_eq!(vec![status::CHECK_CONDITION], *bus.sent.last().unwrap());
        assert_eq!(
            (sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT),
            controller.device(1).unwrap().state().sense()
        );
        assert_eq!((0, 0), controller.device(0).unwrap().state().sense());
    }

    #[test]
    fn test_transaction_block_read() {
        let (_file, device) = image_hd(0, 2);
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(device);

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        // READ(10), LBA 0, 2 blocks
        bus.cdbs.push_back(vec![0x28, 0, 0, 0, 0, 0, 0, 0, 2, 0]);

        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));

        assert_eq!(4, bus.sent.len());
        assert_eq!(vec![0xD0; 512], bus.sent[0]);
        assert_eq!(vec![0xD1; 512], bus.sent[1]);
        assert_eq!(vec![status::GOOD], bus.sent[2]);
    }

    #[test]
    fn test_transaction_block_write() {
        let (file, device) = image_hd(0, 2);
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(device);

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        // WRITE(10), LBA 0, 2 blocks
        bus.cdbs.push_back(vec![0x2A, 0, 0, 0, 0, 0, 0, 0, 2, 0]);
        bus.data_out.push_back(vec![0xA1; 512]);
        bus.data_out.push_back(vec![0xA2; 512]);

        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));

        assert_eq!(vec![status::GOOD], bus.sent[0]);
        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(vec![0xA1; 512], written[0..512]);
        assert_eq!(vec![0xA2; 512], written[512..1024]);
    }

    #[test]
    fn test_transaction_mode_select() {
        let (_file, device) = image_hd(0, 2);
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(device);

        // MODE SELECT(6) with PF, 28 parameter bytes: header plus format page
        // confirming the current 512-byte sectors
        let mut list = vec![0u8; 4 + 24];
        list[4] = 0x03;
        list[5] = 0x16;
        list[4 + 12] = 0x02;

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        bus.cdbs
            .push_back(vec![0x15, 0x10, 0, 0, list.len() as u8, 0]);
        bus.data_out.push_back(list);

        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));
        assert_eq!(vec![status::GOOD], bus.sent[0]);
    }

    #[test]
    fn test_transaction_short_send_aborts() {
        let mut bus = TestBus::new();
        bus.fail_send = true;
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        bus.cdbs.push_back(vec![0x12, 0, 0, 0, 36, 0]);

        // The transaction must still terminate at bus free
        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));
        assert!(controller.phase().is_bus_free());
    }

    #[test]
    fn test_selection_ignored_without_id_bit_or_luns() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        // Our id bit is missing from DAT
        bus.push_frame(select(3, 7));
        let phase = controller.process(&mut bus, Some(7));
        assert!(phase.is_bus_free());

        // No LUNs attached
        let mut empty = Controller::new(4);
        let mut bus = TestBus::new();
        bus.push_frame(select(4, 7));
        let phase = empty.process(&mut bus, Some(7));
        assert!(phase.is_bus_free());
    }

    #[test]
    fn test_unknown_opcode_reports_invalid_command() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(4);
        controller.add_device(ready_hd(0, 1, 512));

        bus.push_frame(select(4, 7));
        bus.push_frame(SignalFrame::default());
        bus.cdbs.push_back(vec![0xC2, 0, 0, 0, 0, 0]);

        controller.process_transaction(&mut bus, (1 << 4) | (1 << 7));
        assert_eq!(vec![status::CHECK_CONDITION], bus.sent[0]);
        assert_eq!(
            (sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND),
            controller.device(0).unwrap().state().sense()
        );
    }

    // ------------------------------------------------------------------------
    // Message parsing
    // ------------------------------------------------------------------------

    #[test]
    fn test_sdtr_negotiation_clamps_and_replies() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));
        controller.set_sync_transfer_enabled(true);

        controller.set_phase(Phase::MsgOut);
        controller.atn_msg = true;
        controller.msg_bytes = vec![message::EXTENDED_MESSAGE, 0x03, 0x01, 100, 20];
        controller.process_message(&mut bus);

        assert!(controller.phase().is_msg_in());
        assert_eq!(5, controller.ctrl.length);
        assert_eq!(
            [0x01, 0x03, 0x01, MAX_SYNC_PERIOD, MAX_SYNC_OFFSET],
            controller.ctrl.buffer[0..5]
        );
    }

    #[test]
    fn test_extended_message_rejected_without_sync() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));

        controller.set_phase(Phase::MsgOut);
        controller.atn_msg = true;
        controller.msg_bytes = vec![message::EXTENDED_MESSAGE, 0x03, 0x01, 100, 20];
        controller.process_message(&mut bus);

        assert!(controller.phase().is_msg_in());
        assert_eq!(1, controller.ctrl.length);
        assert_eq!(message::MESSAGE_REJECT, controller.ctrl.buffer[0]);
    }

    #[test]
    fn test_abort_message_frees_the_bus() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));

        controller.set_phase(Phase::MsgOut);
        controller.atn_msg = true;
        controller.msg_bytes = vec![message::ABORT];
        controller.process_message(&mut bus);
        assert!(controller.phase().is_bus_free());
    }

    #[test]
    fn test_bus_device_reset_discards_reservation() {
        let mut bus = TestBus::new();
        let mut controller = Controller::new(0);
        controller.add_device(ready_hd(0, 1, 512));
        controller
            .device_mut(0)
            .unwrap()
            .state_mut()
            .reserve(Some(1));
        controller.identified_lun = Some(0);

        controller.set_phase(Phase::MsgOut);
        controller.atn_msg = true;
        controller.msg_bytes = vec![message::BUS_DEVICE_RESET];
        controller.process_message(&mut bus);

        assert!(controller.phase().is_bus_free());
        assert!(controller
            .device(0)
            .unwrap()
            .state()
            .check_reservation(Some(2), &[opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0]));
    }
}
