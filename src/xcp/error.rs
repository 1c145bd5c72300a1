use crate::ProtocolError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// XCP negative response codes (`ERR_*`)
pub enum XcpError {
    /// Command processor synchronization
    CmdSynch,
    /// Command was not executed
    CmdBusy,
    /// Command rejected because DAQ is running
    DaqActive,
    /// Command rejected because PGM is running
    PgmActive,
    /// Unknown command or not implemented optional command
    CmdUnknown,
    /// Command syntax invalid
    CmdSyntax,
    /// Command parameter out of range
    OutOfRange,
    /// The memory location is write protected
    WriteProtected,
    /// The memory location is not accessible
    AccessDenied,
    /// Seed & key is required
    AccessLocked,
    /// Selected page not available
    PageNotValid,
    /// Selected page mode not available
    ModeNotValid,
    /// Selected segment not valid
    SegmentNotValid,
    /// Sequence error
    Sequence,
    /// DAQ configuration not valid
    DaqConfig,
    /// Memory overflow
    MemoryOverflow,
    /// Generic error
    Generic,
    /// The slave internal program verify routine failed
    Verify,
    /// Code not defined by XCP
    Unknown(u8),
}

impl From<u8> for XcpError {
    fn from(p: u8) -> Self {
        match p {
            0x00 => Self::CmdSynch,
            0x10 => Self::CmdBusy,
            0x11 => Self::DaqActive,
            0x12 => Self::PgmActive,
            0x20 => Self::CmdUnknown,
            0x21 => Self::CmdSyntax,
            0x22 => Self::OutOfRange,
            0x23 => Self::WriteProtected,
            0x24 => Self::AccessDenied,
            0x25 => Self::AccessLocked,
            0x26 => Self::PageNotValid,
            0x27 => Self::ModeNotValid,
            0x28 => Self::SegmentNotValid,
            0x29 => Self::Sequence,
            0x2A => Self::DaqConfig,
            0x30 => Self::MemoryOverflow,
            0x31 => Self::Generic,
            0x32 => Self::Verify,
            x => Self::Unknown(x),
        }
    }
}

impl ProtocolError for XcpError {
    fn desc(&self) -> String {
        match self {
            Self::CmdSynch => "Command processor synchronization",
            Self::CmdBusy => "Command was not executed",
            Self::DaqActive => "Command rejected because DAQ is running",
            Self::PgmActive => "Command rejected because PGM is running",
            Self::CmdUnknown => "Unknown command or not implemented optional command",
            Self::CmdSyntax => "Command syntax invalid",
            Self::OutOfRange => "Command syntax valid but command parameter(s) out of range",
            Self::WriteProtected => "The memory location is write protected",
            Self::AccessDenied => "The memory location is not accessible",
            Self::AccessLocked => "Access denied, Seed & Key is required",
            Self::PageNotValid => "Selected page not available",
            Self::ModeNotValid => "Selected page mode not available",
            Self::SegmentNotValid => "Selected segment not valid",
            Self::Sequence => "Sequence error",
            Self::DaqConfig => "DAQ configuration not valid",
            Self::MemoryOverflow => "Memory overflow error",
            Self::Generic => "Generic error",
            Self::Verify => "The slave internal program verify routine detects an error",
            Self::Unknown(_) => "Unknown XCP Errorcode",
        }
        .to_string()
    }
}
