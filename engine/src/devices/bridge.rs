//! Host bridge stub: a communications-type LUN answering the shared command
//! set only. The full file-sharing protocol lives in host-specific drivers
//! outside this engine.

use retroscsi_protocol::wire::InquiryData;
use retroscsi_protocol::{device_type, opcode, scsi_level};

use crate::devices::primary;
use crate::devices::state::DeviceState;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;

/// Host bridge LUN
#[derive(Debug)]
pub struct HostBridge {
    pub state: DeviceState,
}

impl HostBridge {
    pub fn new(lun: u8) -> Self {
        let mut state = DeviceState::new(lun, scsi_level::SCSI_2);
        state.set_product("HOST BRIDGE", true);
        state.set_ready(true);
        state.set_supports_params(true);
        Self { state }
    }

    pub fn inquiry_data(&self) -> Vec<u8> {
        let mut inq = InquiryData::new(device_type::COMMUNICATIONS, self.state.scsi_level(), false);
        inq.set_identity(self.state.vendor(), self.state.product(), self.state.revision());
        inq.to_bytes().to_vec()
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            opcode::TEST_UNIT_READY => Ok(Response::Status),
            opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
            _ => primary::dispatch_basic(&mut self.state, ctx)
                .unwrap_or_else(|| Err(ScsiFault::invalid_command())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(cdb: &'a [u8]) -> CommandContext<'a> {
        CommandContext {
            cdb,
            attached_luns: &[0],
            initiator: Some(7),
        }
    }

    #[test]
    fn test_inquiry() {
        let mut bridge = HostBridge::new(0);
        let mut cdb = [0u8; 6];
        cdb[0] = opcode::INQUIRY;
        cdb[4] = 255;
        match bridge.dispatch(&ctx(&cdb)).unwrap() {
            Response::DataIn(data) => {
                assert_eq!(device_type::COMMUNICATIONS, data[0]);
                assert_eq!(b"RETRO   HOST BRIDGE     ", &data[8..32]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command() {
        let mut bridge = HostBridge::new(0);
        let cdb = [0xFFu8, 0, 0, 0, 0, 0];
        assert!(bridge.dispatch(&ctx(&cdb)).is_err());
    }
}
