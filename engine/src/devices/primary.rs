//! Commands every logical unit supports.

use retroscsi_protocol::wire::{set_u32, SenseData};
use retroscsi_protocol::opcode;

use crate::devices::state::DeviceState;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;

/// Report a pending unit attention condition, observing the reset/attention
/// ordering: a reset outranks an attention, and each is reported once.
pub fn check_attention(state: &mut DeviceState) -> Result<(), ScsiFault> {
    if state.is_reset() {
        state.set_reset(false);
        return Err(ScsiFault::power_on_or_reset());
    }
    if state.is_attn() {
        state.set_attn(false);
        return Err(ScsiFault::not_ready_to_ready_change());
    }
    Ok(())
}

/// TEST UNIT READY
pub fn test_unit_ready(state: &mut DeviceState) -> Result<Response, ScsiFault> {
    check_attention(state)?;
    if !state.is_ready() {
        return Err(ScsiFault::not_ready());
    }
    Ok(Response::Status)
}

/// INQUIRY. `data` is the device's full response; the transfer honors the
/// allocation length. EVPD and page codes are not supported.
pub fn inquiry(cdb: &[u8], mut data: Vec<u8>) -> Result<Response, ScsiFault> {
    if cdb[1] & 0x01 != 0 || cdb[2] != 0 {
        return Err(ScsiFault::invalid_field_in_cdb());
    }
    data.truncate(cdb[4] as usize);
    Ok(Response::DataIn(data))
}

/// REQUEST SENSE: 18 bytes of fixed-format sense data.
///
/// Not-ready is reported only when no sense is pending; an unready device
/// still serves the sense data of a preceding fault.
pub fn request_sense(state: &DeviceState, cdb: &[u8]) -> Result<Response, ScsiFault> {
    if !state.has_sense() && !state.is_ready() {
        return Err(ScsiFault::not_ready());
    }
    let (sense_key, asc) = state.sense();
    let mut data = SenseData::new(sense_key, asc).to_bytes().to_vec();
    data.truncate(cdb[4] as usize);
    Ok(Response::DataIn(data))
}

/// REPORT LUNS: 8-byte header plus one 8-byte descriptor per attached LUN.
pub fn report_luns(cdb: &[u8], attached_luns: &[u8]) -> Result<Response, ScsiFault> {
    // Only SELECT REPORT 0 is supported
    if cdb[2] != 0 {
        return Err(ScsiFault::invalid_field_in_cdb());
    }

    let mut data = vec![0u8; 8 + 8 * attached_luns.len()];
    set_u32(&mut data, 0, (8 * attached_luns.len()) as u32);
    for (i, lun) in attached_luns.iter().enumerate() {
        data[8 + 8 * i + 1] = *lun;
    }

    let alloc = retroscsi_protocol::wire::get_u32(cdb, 6) as usize;
    data.truncate(alloc);
    Ok(Response::DataIn(data))
}

/// RESERVE(6)
pub fn reserve(state: &mut DeviceState, ctx: &CommandContext) -> Result<Response, ScsiFault> {
    state.reserve(ctx.initiator);
    Ok(Response::Status)
}

/// RELEASE(6)
pub fn release(state: &mut DeviceState) -> Result<Response, ScsiFault> {
    state.release();
    Ok(Response::Status)
}

/// SEND DIAGNOSTIC: only the default self test without a parameter list
pub fn send_diagnostic(cdb: &[u8]) -> Result<Response, ScsiFault> {
    // PF bit
    if cdb[1] & 0x10 != 0 {
        return Err(ScsiFault::invalid_field_in_cdb());
    }
    // Parameter list length
    if cdb[3] != 0 || cdb[4] != 0 {
        return Err(ScsiFault::invalid_field_in_cdb());
    }
    Ok(Response::Status)
}

/// Dispatch the command set shared by all kinds, except INQUIRY whose
/// response data is kind-specific. Returns `None` for other opcodes.
pub fn dispatch_basic(
    state: &mut DeviceState,
    ctx: &CommandContext,
) -> Option<Result<Response, ScsiFault>> {
    let result = match ctx.cdb[0] {
        opcode::TEST_UNIT_READY => test_unit_ready(state),
        opcode::REQUEST_SENSE => request_sense(state, ctx.cdb),
        opcode::REPORT_LUNS => report_luns(ctx.cdb, ctx.attached_luns),
        opcode::RESERVE_6 => reserve(state, ctx),
        opcode::RELEASE_6 => release(state),
        opcode::SEND_DIAGNOSTIC => send_diagnostic(ctx.cdb),
        _ => return None,
    };
    Some(result)
}
