//! SCSI bus phases.

/// Bus phase, as defined by the SCSI-2 signal truth table.
///
/// `Arbitration` and `Reselection` exist for completeness; a single-initiator
/// target never enters them and treats them (like `Reserved`) as error states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BusFree,
    Arbitration,
    Selection,
    Reselection,
    Command,
    DataOut,
    DataIn,
    Status,
    MsgOut,
    MsgIn,
    Reserved,
}

impl Phase {
    /// Derive the phase from the control signals.
    ///
    /// BSY low and SEL low is bus free; SEL high is selection; otherwise the
    /// MSG/CD/IO triple selects the information transfer phase.
    pub fn from_signals(bsy: bool, sel: bool, msg: bool, cd: bool, io: bool) -> Phase {
        if !bsy && !sel {
            return Phase::BusFree;
        }
        if sel {
            return Phase::Selection;
        }
        Phase::from_mci(((msg as u8) << 2) | ((cd as u8) << 1) | (io as u8))
    }

    /// Decode the 3-bit MSG/CD/IO value of an information transfer phase.
    pub fn from_mci(mci: u8) -> Phase {
        match mci & 0b111 {
            0b000 => Phase::DataOut,
            0b001 => Phase::DataIn,
            0b010 => Phase::Command,
            0b011 => Phase::Status,
            0b110 => Phase::MsgOut,
            0b111 => Phase::MsgIn,
            _ => Phase::Reserved,
        }
    }

    pub fn is_bus_free(self) -> bool {
        self == Phase::BusFree
    }

    pub fn is_selection(self) -> bool {
        self == Phase::Selection
    }

    pub fn is_command(self) -> bool {
        self == Phase::Command
    }

    pub fn is_data_out(self) -> bool {
        self == Phase::DataOut
    }

    pub fn is_data_in(self) -> bool {
        self == Phase::DataIn
    }

    pub fn is_status(self) -> bool {
        self == Phase::Status
    }

    pub fn is_msg_out(self) -> bool {
        self == Phase::MsgOut
    }

    pub fn is_msg_in(self) -> bool {
        self == Phase::MsgIn
    }

    /// Lower-case phase name for log output
    pub fn name(self) -> &'static str {
        match self {
            Phase::BusFree => "busfree",
            Phase::Arbitration => "arbitration",
            Phase::Selection => "selection",
            Phase::Reselection => "reselection",
            Phase::Command => "command",
            Phase::DataOut => "dataout",
            Phase::DataIn => "datain",
            Phase::Status => "status",
            Phase::MsgOut => "msgout",
            Phase::MsgIn => "msgin",
            Phase::Reserved => "reserved",
        }
    }
}
