//! The bus capability consumed by the controller.
//!
//! The physical GPIO layer lives outside this crate; the engine drives the
//! bus exclusively through this trait. Signal state follows positive logic:
//! asserted is `true`, after whatever inversion the hardware layer applies.
//! Lifecycle (`init`/`cleanup` in hardware terms) maps onto construction and
//! `Drop` of the implementing type.

use retroscsi_protocol::Phase;

/// SCSI bus signal and handshake interface.
///
/// `acquire` latches all input lines into a snapshot; the signal getters
/// reflect that snapshot until the next call. The handshake methods block for
/// at most the initiator's REQ/ACK cadence plus the implementation's timeout
/// and report the number of bytes actually moved.
pub trait Bus {
    /// Latch all signal lines
    fn acquire(&mut self);

    /// Release all target-driven signals and return the bus to an idle state
    fn reset(&mut self);

    fn get_bsy(&self) -> bool;
    fn set_bsy(&mut self, state: bool);

    fn get_sel(&self) -> bool;
    fn set_sel(&mut self, state: bool);

    fn get_atn(&self) -> bool;
    fn set_atn(&mut self, state: bool);

    fn get_ack(&self) -> bool;
    fn set_ack(&mut self, state: bool);

    fn get_rst(&self) -> bool;
    fn set_rst(&mut self, state: bool);

    fn get_msg(&self) -> bool;
    fn set_msg(&mut self, state: bool);

    fn get_cd(&self) -> bool;
    fn set_cd(&mut self, state: bool);

    fn get_io(&self) -> bool;
    fn set_io(&mut self, state: bool);

    fn get_req(&self) -> bool;
    fn set_req(&mut self, state: bool);

    /// Data byte currently on the bus
    fn get_dat(&self) -> u8;
    fn set_dat(&mut self, data: u8);

    /// Receive a command descriptor block with the REQ/ACK handshake.
    ///
    /// Returns the number of bytes read, 0 on error.
    fn command_handshake(&mut self, buf: &mut [u8]) -> usize;

    /// Send bytes to the initiator. `delay_hint` is a device-provided pacing
    /// hint in microseconds between bytes; 0 means full speed.
    fn send_handshake(&mut self, data: &[u8], delay_hint: u32) -> usize;

    /// Receive bytes from the initiator
    fn receive_handshake(&mut self, buf: &mut [u8]) -> usize;

    /// Derive the current phase from the latched control signals
    fn phase(&self) -> Phase {
        Phase::from_signals(
            self.get_bsy(),
            self.get_sel(),
            self.get_msg(),
            self.get_cd(),
            self.get_io(),
        )
    }
}
