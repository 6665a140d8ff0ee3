//! The eight phase routines and the transfer loop.
//!
//! Each routine is reentrant within its phase: the first call raises the
//! signal lines and prepares the transfer counters, subsequent calls perform
//! the actual handshakes.

use std::time::{Duration, Instant};

use retroscsi_protocol::{asc, command_byte_count, message, opcode, sense_key, status, Phase};
use tracing::{debug, trace, warn};

use super::{Controller, MAX_SYNC_OFFSET, MAX_SYNC_PERIOD, MIN_EXEC_TIME_US};
use crate::bus::Bus;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;
use crate::ShutdownMode;

/// Result of message-out parsing
enum MessageOutcome {
    /// Only IDENTIFY-style messages were seen; continue with the command phase
    Continue,
    /// The parser already moved to another phase
    Handled,
}

impl Controller {
    // ========================================================================
    // Phase routines
    // ========================================================================

    pub(crate) fn bus_free_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_bus_free() {
            trace!("bus free phase");

            self.set_phase(Phase::BusFree);

            bus.set_req(false);
            bus.set_msg(false);
            bus.set_cd(false);
            bus.set_io(false);
            bus.set_bsy(false);

            self.ctrl.status = status::GOOD;
            self.ctrl.message = 0x00;
            self.atn_msg = false;
            self.identified_lun = None;
            self.set_byte_transfer(false);

            // A scheduled shutdown is honored here; flush everything first
            if self.shutdown != ShutdownMode::None {
                for device in self.devices_mut() {
                    device.flush_cache();
                }
            }

            return;
        }

        // A selection may follow immediately
        if bus.get_sel() && !bus.get_bsy() {
            self.selection_phase(bus);
        }
    }

    pub(crate) fn selection_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_selection() {
            // Another target was selected
            if bus.get_dat() & (1 << self.target_id()) == 0 {
                return;
            }

            // Do not respond without any LUN attached
            if self.lun_count() == 0 {
                return;
            }

            trace!(target_id = self.target_id(), "selection phase");

            self.set_phase(Phase::Selection);
            bus.set_bsy(true);
            return;
        }

        // Selection completes when the initiator drops SEL; ATN selects the
        // message-out phase
        if !bus.get_sel() && bus.get_bsy() {
            if bus.get_atn() {
                self.msg_out_phase(bus);
            } else {
                self.command_phase(bus);
            }
        }
    }

    pub(crate) fn command_phase(&mut self, bus: &mut dyn Bus) {
        if self.phase.is_command() {
            return;
        }

        trace!("command phase");

        self.set_phase(Phase::Command);
        bus.set_msg(false);
        bus.set_cd(true);
        bus.set_io(false);

        self.allocate_buffer(16);
        let actual_count = bus.command_handshake(&mut self.ctrl.buffer[..16]);
        if actual_count == 0 {
            trace!(opcode = self.ctrl.buffer[0], "unknown command received");
            self.error(bus, ScsiFault::invalid_command());
            return;
        }

        let command_byte_count = command_byte_count(self.ctrl.buffer[0]);
        if actual_count != command_byte_count {
            warn!(
                opcode = self.ctrl.buffer[0],
                expected = command_byte_count,
                received = actual_count,
                "command byte count mismatch"
            );
            self.error(bus, ScsiFault::aborted());
            return;
        }

        self.allocate_cmd(command_byte_count);
        self.ctrl.cmd.fill(0);
        let cdb: Vec<u8> = self.ctrl.buffer[..command_byte_count].to_vec();
        self.ctrl.cmd[..command_byte_count].copy_from_slice(&cdb);
        trace!(cdb = ?&self.ctrl.cmd[..command_byte_count], "CDB received");

        self.ctrl.length = 0;
        self.execute(bus);
    }

    /// Resolve the addressed LUN, check the reservation and dispatch the
    /// command. The single catch point for command faults.
    pub(crate) fn execute(&mut self, bus: &mut dyn Bus) {
        let op = self.ctrl.cmd[0];
        trace!(opcode = op, "executing command");

        self.ctrl.offset = 0;
        self.ctrl.blocks = 1;
        self.exec_start = Some(Instant::now());

        // Discard the pending status of the previous command unless the
        // initiator is about to fetch its sense data
        if op != opcode::REQUEST_SENSE {
            self.ctrl.status = status::GOOD;
        }

        let mut lun = self.effective_lun();
        let mut missing_lun_inquiry = false;
        if !self.has_device(lun) {
            if op != opcode::INQUIRY && op != opcode::REQUEST_SENSE {
                trace!(lun, target_id = self.target_id(), "invalid LUN");
                self.error(bus, ScsiFault::invalid_lun());
                return;
            }

            if !self.has_device(0) {
                self.error(bus, ScsiFault::invalid_lun());
                return;
            }

            // SCSI-2 4.4.3: INQUIRY and REQUEST SENSE answer from LUN 0
            missing_lun_inquiry = op == opcode::INQUIRY;
            lun = 0;
            if op == opcode::REQUEST_SENSE {
                if let Some(device) = self.device_mut(0) {
                    device
                        .state_mut()
                        .set_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_LUN);
                }
            }
        }

        let cdb = self.ctrl.cmd.clone();
        let attached_luns = self.attached_luns();
        let initiator = self.initiator_id;

        let device = self.luns[lun as usize].as_mut().expect("LUN was resolved");
        if op != opcode::REQUEST_SENSE {
            device.state_mut().clear_sense();
        }

        if !device.state().check_reservation(initiator, &cdb) {
            debug!(lun, "reservation conflict");
            self.error(
                bus,
                ScsiFault::aborted().with_status(status::RESERVATION_CONFLICT),
            );
            return;
        }

        let context = CommandContext {
            cdb: &cdb,
            attached_luns: &attached_luns,
            initiator,
        };
        match device.dispatch(&context) {
            Ok(response) => self.apply_response(bus, response, missing_lun_inquiry),
            Err(fault) => self.error(bus, fault),
        }
    }

    /// Translate a device response into transfer state and enter the next
    /// phase. All `ctrl` mutation stays here.
    fn apply_response(&mut self, bus: &mut dyn Bus, response: Response, missing_lun_inquiry: bool) {
        match response {
            Response::Status => self.status_phase(bus),
            Response::DataIn(data) => {
                self.stage(&data);
                if missing_lun_inquiry && self.ctrl.length > 0 {
                    // Peripheral qualifier: no device at this LUN
                    self.ctrl.buffer[0] = 0x7F;
                }
                self.ctrl.blocks = 1;
                self.data_in_phase(bus);
            }
            Response::BlockRead {
                first,
                next,
                blocks,
            } => {
                self.stage(&first);
                self.ctrl.next = next;
                self.ctrl.blocks = blocks;
                self.data_in_phase(bus);
            }
            Response::BlockWrite { lba, chunk, blocks } => {
                self.allocate_buffer(chunk);
                self.ctrl.offset = 0;
                self.ctrl.length = chunk;
                self.ctrl.next = lba;
                self.ctrl.blocks = blocks;
                self.data_out_phase(bus);
            }
            Response::ParamOut { length } => {
                self.allocate_buffer(length);
                self.ctrl.offset = 0;
                self.ctrl.length = length;
                self.ctrl.blocks = 1;
                self.data_out_phase(bus);
            }
            Response::ByteOut { length } => {
                self.allocate_buffer(length);
                self.set_byte_transfer(true);
                self.ctrl.offset = 0;
                self.ctrl.length = length;
                self.ctrl.blocks = 1;
                self.data_out_phase(bus);
            }
            Response::Shutdown(mode) => {
                self.schedule_shutdown(mode);
                self.status_phase(bus);
            }
        }
    }

    /// Copy response data into the transfer buffer and arm the counters
    fn stage(&mut self, data: &[u8]) {
        self.allocate_buffer(data.len());
        self.ctrl.buffer[..data.len()].copy_from_slice(data);
        self.ctrl.offset = 0;
        self.ctrl.length = data.len();
    }

    pub(crate) fn status_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_status() {
            if self.exec_start.is_some() {
                self.sleep_min_exec_time();
            } else {
                std::thread::sleep(Duration::from_micros(5));
            }

            trace!(status = self.ctrl.status, "status phase");

            self.set_phase(Phase::Status);
            bus.set_msg(false);
            bus.set_cd(true);
            bus.set_io(true);

            // One byte in one block
            self.ctrl.offset = 0;
            self.ctrl.length = 1;
            self.ctrl.blocks = 1;
            self.ctrl.buffer[0] = self.ctrl.status;
            return;
        }

        self.send(bus);
    }

    pub(crate) fn msg_in_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_msg_in() {
            trace!("message in phase");

            self.set_phase(Phase::MsgIn);
            bus.set_msg(true);
            bus.set_cd(true);
            bus.set_io(true);

            self.ctrl.offset = 0;
            return;
        }

        self.send(bus);
    }

    pub(crate) fn msg_out_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_msg_out() {
            trace!("message out phase");

            // Collect the message bytes following selection with ATN
            if self.phase.is_selection() {
                self.atn_msg = true;
                self.msg_bytes.clear();
            }

            self.set_phase(Phase::MsgOut);
            bus.set_msg(true);
            bus.set_cd(true);
            bus.set_io(false);

            // One byte in one block
            self.ctrl.offset = 0;
            self.ctrl.length = 1;
            self.ctrl.blocks = 1;
            return;
        }

        self.receive(bus);
    }

    pub(crate) fn data_in_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_data_in() {
            self.sleep_min_exec_time();

            // Nothing to send: the command completes with its status
            if self.ctrl.length == 0 {
                self.status_phase(bus);
                return;
            }

            trace!("data in phase");

            self.set_phase(Phase::DataIn);
            bus.set_msg(false);
            bus.set_cd(false);
            bus.set_io(true);

            self.ctrl.offset = 0;
            return;
        }

        self.send(bus);
    }

    pub(crate) fn data_out_phase(&mut self, bus: &mut dyn Bus) {
        if !self.phase.is_data_out() {
            self.sleep_min_exec_time();

            if self.ctrl.length == 0 {
                self.status_phase(bus);
                return;
            }

            trace!("data out phase");

            self.set_phase(Phase::DataOut);
            bus.set_msg(false);
            bus.set_cd(false);
            bus.set_io(false);

            self.ctrl.offset = 0;
            return;
        }

        self.receive(bus);
    }

    /// Route a fault to the initiator: record the sense on the addressed
    /// device (LUN 0 as fallback) and enter the status phase. During status
    /// or message-in the bus is freed instead.
    pub(crate) fn error(&mut self, bus: &mut dyn Bus, fault: ScsiFault) {
        bus.acquire();

        if bus.get_rst() {
            self.reset();
            bus.reset();
            return;
        }

        if self.phase.is_status() || self.phase.is_msg_in() {
            self.bus_free_phase(bus);
            return;
        }

        let mut lun = self.effective_lun();
        if !self.has_device(lun) || fault.asc == asc::INVALID_LUN {
            if !self.has_device(0) {
                warn!(target_id = self.target_id(), "no LUN 0 to record the sense on");

                self.ctrl.status = fault.status;
                self.ctrl.message = 0x00;
                self.status_phase(bus);
                return;
            }

            lun = 0;
        }

        if fault.sense_key != sense_key::NO_SENSE || fault.asc != asc::NO_ADDITIONAL_SENSE {
            debug!(
                sense_key = fault.sense_key,
                asc = fault.asc,
                "error status for the next REQUEST SENSE"
            );
            if let Some(device) = self.device_mut(lun) {
                device.state_mut().set_sense(fault.sense_key, fault.asc);
            }
        }

        self.ctrl.status = fault.status;
        self.ctrl.message = 0x00;

        trace!("error, entering status phase");
        self.status_phase(bus);
    }

    // ========================================================================
    // Transfer loop
    // ========================================================================

    /// Data-in side of the transfer loop: push the staged chunk, then fetch
    /// the next block or move to the next phase.
    fn send(&mut self, bus: &mut dyn Bus) {
        debug_assert!(!bus.get_req());
        debug_assert!(bus.get_io());

        if self.ctrl.length > 0 {
            trace!(
                offset = self.ctrl.offset,
                length = self.ctrl.length,
                "sending handshake"
            );

            let delay = self.device(0).map_or(0, |device| device.send_delay());
            let range = self.ctrl.offset..self.ctrl.offset + self.ctrl.length;
            let sent = bus.send_handshake(&self.ctrl.buffer[range], delay);
            if sent != self.ctrl.length {
                self.error(bus, ScsiFault::aborted());
                return;
            }

            self.ctrl.offset += self.ctrl.length;
            self.ctrl.length = 0;
            return;
        }

        self.ctrl.blocks -= 1;

        // Fetch the next sector while a block read is in flight
        if self.phase.is_data_in() && self.ctrl.blocks > 0 {
            if !self.next_block_in() {
                self.error(bus, ScsiFault::aborted());
                return;
            }
            trace!(blocks = self.ctrl.blocks, "continuing data in");
        }

        if self.ctrl.blocks > 0 {
            debug_assert!(self.ctrl.length > 0);
            debug_assert_eq!(0, self.ctrl.offset);
            return;
        }

        match self.phase {
            Phase::MsgIn => {
                if self.atn_msg {
                    // The reply to an extended message has been sent;
                    // continue with the command
                    self.atn_msg = false;
                    self.command_phase(bus);
                } else {
                    self.bus_free_phase(bus);
                }
            }
            Phase::DataIn => self.status_phase(bus),
            Phase::Status => {
                self.ctrl.length = 1;
                self.ctrl.blocks = 1;
                self.ctrl.buffer[0] = self.ctrl.message;
                self.msg_in_phase(bus);
            }
            _ => debug_assert!(false, "send completed in phase {}", self.phase.name()),
        }
    }

    /// Stage the next sector of a multi-block read
    fn next_block_in(&mut self) -> bool {
        let lun = self.effective_lun();
        match self.ctrl.cmd[0] {
            opcode::READ_6 | opcode::READ_10 | opcode::READ_16 => {
                let next = self.ctrl.next;
                let Some(device) = self.luns[lun as usize].as_mut() else {
                    return false;
                };
                match device.read_block(next) {
                    Ok(data) => {
                        self.stage(&data);
                        self.ctrl.next += 1;
                        true
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    /// Data-out side of the transfer loop
    fn receive(&mut self, bus: &mut dyn Bus) {
        if self.byte_transfer {
            self.receive_bytes(bus);
            return;
        }

        debug_assert!(!bus.get_req());
        debug_assert!(!bus.get_io());

        if self.ctrl.length > 0 {
            trace!(length = self.ctrl.length, "receiving handshake");

            let range = self.ctrl.offset..self.ctrl.offset + self.ctrl.length;
            let received = bus.receive_handshake(&mut self.ctrl.buffer[range]);
            if received != self.ctrl.length {
                warn!(
                    expected = self.ctrl.length,
                    received, "short receive handshake"
                );
                self.error(bus, ScsiFault::aborted());
                return;
            }

            self.ctrl.offset += self.ctrl.length;
            self.ctrl.length = 0;
            return;
        }

        self.ctrl.blocks -= 1;

        let result = match self.phase {
            Phase::DataOut => {
                let cont = self.ctrl.blocks > 0;
                self.consume_chunk(cont)
            }
            Phase::MsgOut => {
                self.ctrl.message = self.ctrl.buffer[0];
                self.note_message_byte();
                self.ctrl.message = 0x00;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(fault) = result {
            self.error(bus, fault);
            return;
        }

        if self.ctrl.blocks > 0 {
            debug_assert!(self.ctrl.length > 0);
            debug_assert_eq!(0, self.ctrl.offset);
            return;
        }

        match self.phase {
            Phase::MsgOut => self.process_message(bus),
            Phase::DataOut => self.status_phase(bus),
            _ => debug_assert!(false, "receive completed in phase {}", self.phase.name()),
        }
    }

    /// Hand one received chunk to the device: a written sector, or a complete
    /// parameter list.
    fn consume_chunk(&mut self, cont: bool) -> Result<(), ScsiFault> {
        let cdb = self.ctrl.cmd.clone();
        let lun = self.effective_lun();

        match cdb[0] {
            opcode::WRITE_6
            | opcode::WRITE_10
            | opcode::WRITE_16
            | opcode::VERIFY_10
            | opcode::VERIFY_16 => {
                let lba = self.ctrl.next;
                let chunk_len = self.ctrl.offset;
                let sector_size;
                {
                    let Some(device) = self.luns[lun as usize].as_mut() else {
                        return Err(ScsiFault::aborted());
                    };
                    device.write_block(&cdb, lba, &self.ctrl.buffer[..chunk_len])?;
                    sector_size = device.sector_size() as usize;
                }
                self.ctrl.next += 1;
                if cont {
                    self.ctrl.length = sector_size;
                    self.ctrl.offset = 0;
                }
                Ok(())
            }
            opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10 | opcode::SET_MCAST_ADDR
            | opcode::SET_IFACE_MODE => {
                let data_len = self.ctrl.offset;
                let Some(device) = self.luns[lun as usize].as_mut() else {
                    return Err(ScsiFault::aborted());
                };
                device.accept_parameters(&cdb, &self.ctrl.buffer[..data_len])
            }
            _ => {
                warn!(opcode = cdb[0], "unexpected data out phase");
                Ok(())
            }
        }
    }

    /// Single-shot raw byte transfer (DaynaPort frames, printer data)
    fn receive_bytes(&mut self, bus: &mut dyn Bus) {
        debug_assert!(!bus.get_req());
        debug_assert!(!bus.get_io());

        if self.ctrl.length > 0 {
            trace!(length = self.ctrl.length, "receiving byte sequence");

            let range = self.ctrl.offset..self.ctrl.offset + self.ctrl.length;
            let received = bus.receive_handshake(&mut self.ctrl.buffer[range]);
            if received != self.ctrl.length {
                self.error(bus, ScsiFault::aborted());
                return;
            }

            self.bytes_to_transfer = self.ctrl.length;
            self.ctrl.offset += self.ctrl.length;
            self.ctrl.length = 0;
            return;
        }

        debug_assert!(self.phase.is_data_out());

        let cdb = self.ctrl.cmd.clone();
        let lun = self.effective_lun();
        let count = self.bytes_to_transfer;
        self.set_byte_transfer(false);

        let result = match self.luns[lun as usize].as_mut() {
            Some(device) => device.write_bytes(&cdb, &self.ctrl.buffer[..count]),
            None => Err(ScsiFault::aborted()),
        };

        match result {
            Ok(()) => self.status_phase(bus),
            Err(fault) => self.error(bus, fault),
        }
    }

    // ========================================================================
    // Message out handling
    // ========================================================================

    /// Record a received message byte while collecting an ATN message
    fn note_message_byte(&mut self) {
        if self.atn_msg && self.msg_bytes.len() < 256 {
            self.msg_bytes.push(self.ctrl.message);
        }
    }

    /// The message-out transfer finished; keep receiving while ATN is still
    /// asserted, otherwise interpret the collected bytes.
    pub(super) fn process_message(&mut self, bus: &mut dyn Bus) {
        if bus.get_atn() {
            self.ctrl.offset = 0;
            self.ctrl.length = 1;
            self.ctrl.blocks = 1;
            return;
        }

        if self.atn_msg {
            if let MessageOutcome::Handled = self.parse_message(bus) {
                return;
            }
        }

        self.atn_msg = false;
        self.command_phase(bus);
    }

    /// Interpret the collected message bytes
    fn parse_message(&mut self, bus: &mut dyn Bus) -> MessageOutcome {
        let messages = std::mem::take(&mut self.msg_bytes);

        for (i, &message_type) in messages.iter().enumerate() {
            match message_type {
                message::ABORT => {
                    trace!("ABORT message received");
                    self.bus_free_phase(bus);
                    return MessageOutcome::Handled;
                }

                message::BUS_DEVICE_RESET => {
                    trace!("BUS DEVICE RESET message received");
                    self.sync.offset = 0;
                    if let Some(lun) = self.identified_lun {
                        if let Some(device) = self.device_mut(lun) {
                            device.state_mut().discard_reservation();
                        }
                    }
                    self.bus_free_phase(bus);
                    return MessageOutcome::Handled;
                }

                message::EXTENDED_MESSAGE => {
                    trace!("extended message received");

                    let sub_code = messages.get(i + 2).copied();
                    if !self.sync.enabled || sub_code != Some(message::EXTENDED_SDTR) {
                        self.ctrl.buffer[0] = message::MESSAGE_REJECT;
                        self.ctrl.offset = 0;
                        self.ctrl.length = 1;
                        self.ctrl.blocks = 1;
                        self.msg_in_phase(bus);
                        return MessageOutcome::Handled;
                    }

                    self.sync.period =
                        messages.get(i + 3).copied().unwrap_or(0).min(MAX_SYNC_PERIOD);
                    self.sync.offset =
                        messages.get(i + 4).copied().unwrap_or(0).min(MAX_SYNC_OFFSET);

                    // SDTR response
                    self.ctrl.buffer[0] = message::EXTENDED_MESSAGE;
                    self.ctrl.buffer[1] = 0x03;
                    self.ctrl.buffer[2] = message::EXTENDED_SDTR;
                    self.ctrl.buffer[3] = self.sync.period;
                    self.ctrl.buffer[4] = self.sync.offset;
                    self.ctrl.offset = 0;
                    self.ctrl.length = 5;
                    self.ctrl.blocks = 1;
                    self.msg_in_phase(bus);
                    return MessageOutcome::Handled;
                }

                _ if message_type >= message::IDENTIFY => {
                    let lun = message_type & 0x1F;
                    trace!(lun, "IDENTIFY message received");
                    self.identified_lun = Some(lun);
                }

                _ => {}
            }
        }

        MessageOutcome::Continue
    }

    // ========================================================================
    // Timing
    // ========================================================================

    /// Busy-wait out the remainder of the minimum execution time sampled at
    /// command receipt
    fn sleep_min_exec_time(&mut self) {
        if let Some(start) = self.exec_start.take() {
            let minimum = Duration::from_micros(MIN_EXEC_TIME_US);
            let elapsed = start.elapsed();
            if elapsed < minimum {
                std::thread::sleep(minimum - elapsed);
            }
        }
    }
}
