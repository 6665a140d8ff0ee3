//! Scripted bus double for controller and transaction tests.

use std::collections::VecDeque;

use retroscsi_protocol::command_byte_count;

use crate::bus::Bus;

/// Initiator-driven signal state applied at the next `acquire`
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalFrame {
    pub sel: bool,
    pub atn: bool,
    pub ack: bool,
    pub rst: bool,
    pub dat: u8,
}

/// In-memory [`Bus`] with scripted initiator behavior.
///
/// Signal frames are consumed one per `acquire` call, emulating the bus
/// evolving between poll iterations. CDBs and data-out payloads are fed from
/// queues; everything the target sends is recorded.
#[derive(Debug, Default)]
pub struct TestBus {
    bsy: bool,
    sel: bool,
    atn: bool,
    ack: bool,
    rst: bool,
    msg: bool,
    cd: bool,
    io: bool,
    req: bool,
    dat: u8,

    /// Initiator signal states, one per `acquire`
    pub frames: VecDeque<SignalFrame>,
    /// CDBs delivered by `command_handshake`
    pub cdbs: VecDeque<Vec<u8>>,
    /// Data-out payloads delivered by `receive_handshake`
    pub data_out: VecDeque<Vec<u8>>,
    /// Everything sent to the initiator, one entry per handshake
    pub sent: Vec<Vec<u8>>,
    /// Force short send handshakes
    pub fail_send: bool,
    /// Force short receive handshakes
    pub fail_receive: bool,
    pub reset_count: usize,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an initiator signal state for the next poll iteration
    pub fn push_frame(&mut self, frame: SignalFrame) {
        self.frames.push_back(frame);
    }

    pub fn set_rst_now(&mut self, rst: bool) {
        self.rst = rst;
    }
}

impl Bus for TestBus {
    fn acquire(&mut self) {
        if let Some(frame) = self.frames.pop_front() {
            self.sel = frame.sel;
            self.atn = frame.atn;
            self.ack = frame.ack;
            self.rst = frame.rst;
            self.dat = frame.dat;
        }
    }

    fn reset(&mut self) {
        self.bsy = false;
        self.sel = false;
        self.atn = false;
        self.ack = false;
        self.rst = false;
        self.msg = false;
        self.cd = false;
        self.io = false;
        self.req = false;
        self.dat = 0;
        self.reset_count += 1;
    }

    fn get_bsy(&self) -> bool {
        self.bsy
    }

    fn set_bsy(&mut self, state: bool) {
        self.bsy = state;
    }

    fn get_sel(&self) -> bool {
        self.sel
    }

    fn set_sel(&mut self, state: bool) {
        self.sel = state;
    }

    fn get_atn(&self) -> bool {
        self.atn
    }

    fn set_atn(&mut self, state: bool) {
        self.atn = state;
    }

    fn get_ack(&self) -> bool {
        self.ack
    }

    fn set_ack(&mut self, state: bool) {
        self.ack = state;
    }

    fn get_rst(&self) -> bool {
        self.rst
    }

    fn set_rst(&mut self, state: bool) {
        self.rst = state;
    }

    fn get_msg(&self) -> bool {
        self.msg
    }

    fn set_msg(&mut self, state: bool) {
        self.msg = state;
    }

    fn get_cd(&self) -> bool {
        self.cd
    }

    fn set_cd(&mut self, state: bool) {
        self.cd = state;
    }

    fn get_io(&self) -> bool {
        self.io
    }

    fn set_io(&mut self, state: bool) {
        self.io = state;
    }

    fn get_req(&self) -> bool {
        self.req
    }

    fn set_req(&mut self, state: bool) {
        self.req = state;
    }

    fn get_dat(&self) -> u8 {
        self.dat
    }

    fn set_dat(&mut self, data: u8) {
        self.dat = data;
    }

    fn command_handshake(&mut self, buf: &mut [u8]) -> usize {
        let Some(cdb) = self.cdbs.pop_front() else {
            return 0;
        };
        // The hardware layer refuses opcode groups it cannot size
        if command_byte_count(cdb[0]) == 0 {
            return 0;
        }
        let len = cdb.len().min(buf.len());
        buf[..len].copy_from_slice(&cdb[..len]);
        len
    }

    fn send_handshake(&mut self, data: &[u8], _delay_hint: u32) -> usize {
        if self.fail_send {
            return 0;
        }
        self.sent.push(data.to_vec());
        data.len()
    }

    fn receive_handshake(&mut self, buf: &mut [u8]) -> usize {
        if self.fail_receive {
            return 0;
        }
        let Some(data) = self.data_out.pop_front() else {
            return 0;
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        len
    }
}
