//! DaynaPort SCSI/Link Ethernet adapter emulation.
//!
//! The network backend (a TAP device in production) is opaque to the engine
//! and reached through the [`FrameIo`] capability.

use std::fmt::Debug;
use std::io;

use retroscsi_protocol::wire::InquiryData;
use retroscsi_protocol::{device_type, opcode, scsi_level};
use tracing::{trace, warn};

use crate::devices::primary;
use crate::devices::state::DeviceState;
use crate::devices::{CommandContext, Response};
use crate::error::ScsiFault;

/// Largest Ethernet frame the adapter accepts (without FCS)
const MAX_FRAME_LEN: usize = 1514;

/// Pacing hint for the data-in handshake, in microseconds per byte group.
/// The SCSI/Link driver drops bytes when the target answers at full speed.
const SEND_DELAY: u32 = 6;

// SET INTERFACE MODE sub-commands (CDB byte 5)
const CMD_SCSILINK_STATS: u8 = 0x09;
const CMD_SCSILINK_SET: u8 = 0x0C;
const CMD_SCSILINK_ENABLE: u8 = 0x0E;
const CMD_SCSILINK_SETMAC: u8 = 0x40;
const CMD_SCSILINK_SETMODE: u8 = 0x80;

/// Frame transport behind the adapter
pub trait FrameIo: Debug {
    /// Transmit one Ethernet frame
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Fetch the next pending frame, if any
    fn receive_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// DaynaPort SCSI/Link LUN
#[derive(Debug)]
pub struct DaynaPort {
    pub state: DeviceState,
    netif: Option<Box<dyn FrameIo>>,
    mac: [u8; 6],
    enabled: bool,
}

impl DaynaPort {
    pub fn new(lun: u8) -> Self {
        let mut state = DeviceState::new(lun, scsi_level::SCSI_2);
        state.set_vendor("Dayna");
        state.set_product("SCSI/Link", true);
        state.set_revision("1.4a");
        state.set_ready(true);
        state.set_supports_params(true);
        Self {
            state,
            netif: None,
            mac: [0x00, 0x80, 0x19, 0x10, 0x98, 0xE3],
            enabled: false,
        }
    }

    /// Attach the frame transport
    pub fn set_netif(&mut self, netif: Box<dyn FrameIo>) {
        self.netif = Some(netif);
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The SCSI/Link host driver expects 0x20 additional INQUIRY bytes
    pub fn inquiry_data(&self) -> Vec<u8> {
        let mut inq = InquiryData::new(device_type::PROCESSOR, self.state.scsi_level(), false);
        inq.set_identity(self.state.vendor(), self.state.product(), self.state.revision());
        inq.additional_length = 0x20;
        let mut data = inq.to_bytes().to_vec();
        data.push(0);
        data
    }

    /// GET MESSAGE: deliver one received frame with the 6-byte header the
    /// SCSI/Link driver expects (length plus flags).
    fn read_frame(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        if cdb[5] == 0xFF {
            return Err(ScsiFault::invalid_field_in_cdb());
        }

        let frame = match self.netif.as_mut() {
            Some(netif) if self.enabled => netif.receive_frame().unwrap_or_default(),
            _ => None,
        };

        let Some(frame) = frame else {
            trace!("no frame pending");
            return Ok(Response::DataIn(Vec::new()));
        };

        let mut data = vec![0u8; 6 + frame.len()];
        data[0] = (frame.len() >> 8) as u8;
        data[1] = frame.len() as u8;
        data[6..].copy_from_slice(&frame);
        Ok(Response::DataIn(data))
    }

    /// SEND MESSAGE: receive one frame as a raw byte transfer
    fn write_frame(&self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let length = (usize::from(cdb[3]) << 8) | usize::from(cdb[4]);
        match cdb[5] {
            0x00 => {
                if length == 0 || length > MAX_FRAME_LEN {
                    return Err(ScsiFault::invalid_field_in_cdb());
                }
                Ok(Response::ByteOut { length })
            }
            0x80 => {
                if length == 0 || length > MAX_FRAME_LEN {
                    return Err(ScsiFault::invalid_field_in_cdb());
                }
                // The padded format carries a length header and trailer
                Ok(Response::ByteOut { length: length + 8 })
            }
            _ => Err(ScsiFault::invalid_field_in_cdb()),
        }
    }

    /// Consume a received frame payload
    pub fn write_bytes(&mut self, cdb: &[u8], data: &[u8]) -> Result<(), ScsiFault> {
        let frame: &[u8] = match cdb[5] {
            0x00 => data,
            0x80 => {
                if data.len() < 4 {
                    return Ok(());
                }
                let len = ((usize::from(data[0]) << 8) | usize::from(data[1])).min(data.len() - 4);
                &data[4..4 + len]
            }
            format => {
                warn!(format, "unknown frame data format, frame dropped");
                return Ok(());
            }
        };

        match self.netif.as_mut() {
            Some(netif) => netif
                .send_frame(frame)
                .map_err(|_| ScsiFault::aborted()),
            None => {
                trace!("no network backend, frame dropped");
                Ok(())
            }
        }
    }

    /// RETRIEVE STATISTICS: MAC address plus three error counters
    fn retrieve_statistics(&self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let mut data = vec![0u8; 18];
        data[0..6].copy_from_slice(&self.mac);
        data.truncate(cdb[4] as usize);
        Ok(Response::DataIn(data))
    }

    fn set_interface_mode(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        match cdb[5] {
            CMD_SCSILINK_SETMODE => Ok(Response::Status),
            CMD_SCSILINK_SETMAC => Ok(Response::ParamOut { length: 6 }),
            CMD_SCSILINK_STATS | CMD_SCSILINK_ENABLE | CMD_SCSILINK_SET => {
                Err(ScsiFault::invalid_field_in_cdb())
            }
            _ => Err(ScsiFault::invalid_command()),
        }
    }

    fn set_multicast_addr(&self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let length = cdb[4] as usize;
        if length == 0 {
            return Err(ScsiFault::invalid_field_in_cdb());
        }
        Ok(Response::ParamOut { length })
    }

    fn enable_interface(&mut self, cdb: &[u8]) -> Result<Response, ScsiFault> {
        let enable = cdb[5] & 0x80 == 0;
        if self.netif.is_none() {
            return Err(ScsiFault::aborted());
        }
        self.enabled = enable;
        Ok(Response::Status)
    }

    pub fn dispatch(&mut self, ctx: &CommandContext) -> Result<Response, ScsiFault> {
        match ctx.cdb[0] {
            opcode::TEST_UNIT_READY => Ok(Response::Status),
            opcode::INQUIRY => primary::inquiry(ctx.cdb, self.inquiry_data()),
            opcode::READ_6 => self.read_frame(ctx.cdb),
            opcode::WRITE_6 => self.write_frame(ctx.cdb),
            opcode::RETRIEVE_STATS => self.retrieve_statistics(ctx.cdb),
            opcode::SET_IFACE_MODE => self.set_interface_mode(ctx.cdb),
            opcode::SET_MCAST_ADDR => self.set_multicast_addr(ctx.cdb),
            opcode::ENABLE_INTERFACE => self.enable_interface(ctx.cdb),
            _ => primary::dispatch_basic(&mut self.state, ctx)
                .unwrap_or_else(|| Err(ScsiFault::invalid_command())),
        }
    }

    /// Parameter-list completion for SET MAC and SET MULTICAST ADDRESS
    pub fn accept_parameters(&mut self, cdb: &[u8], data: &[u8]) -> Result<(), ScsiFault> {
        match cdb[0] {
            opcode::SET_IFACE_MODE => {
                if cdb[5] == CMD_SCSILINK_SETMAC && data.len() >= 6 {
                    self.mac.copy_from_slice(&data[0..6]);
                }
                Ok(())
            }
            // Multicast filters are not applied
            opcode::SET_MCAST_ADDR => Ok(()),
            _ => Ok(()),
        }
    }

    pub fn send_delay(&self) -> u32 {
        SEND_DELAY
    }
}
