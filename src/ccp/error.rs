use crate::ProtocolError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// CCP command return codes
pub enum CcpError {
    /// Acknowledge, no error
    Ok,
    /// DAQ processor overload
    DaqOverload,
    /// Processor busy
    CmdBusy,
    /// DAQ processor busy
    DaqBusy,
    /// Internal timeout of the target
    InternalTimeout,
    /// Key request
    KeyRequest,
    /// Session status request
    SessionStatusRequest,
    /// Cold start request
    ColdStartRequest,
    /// Unknown command
    CmdUnknown,
    /// Command syntax error
    CmdSyntax,
    /// Parameter out of range
    ParameterOutOfRange,
    /// Access denied
    NoAccess,
    /// Overload
    Overload,
    /// Access locked
    Locked,
    /// Resource or function not available
    ResourceNotAvailable,
    /// Code not defined by CCP 2.1
    Unknown(u8),
}

impl From<u8> for CcpError {
    fn from(p: u8) -> Self {
        match p {
            0x00 => Self::Ok,
            0x01 => Self::DaqOverload,
            0x10 => Self::CmdBusy,
            0x11 => Self::DaqBusy,
            0x12 => Self::InternalTimeout,
            0x18 => Self::KeyRequest,
            0x19 => Self::SessionStatusRequest,
            0x20 => Self::ColdStartRequest,
            0x30 => Self::CmdUnknown,
            0x31 => Self::CmdSyntax,
            0x32 => Self::ParameterOutOfRange,
            0x33 => Self::NoAccess,
            0x34 => Self::Overload,
            0x35 => Self::Locked,
            0x36 => Self::ResourceNotAvailable,
            x => Self::Unknown(x),
        }
    }
}

impl ProtocolError for CcpError {
    fn desc(&self) -> String {
        match self {
            Self::Ok => "OK",
            Self::DaqOverload => "DAQ Overload",
            Self::CmdBusy => "CMD Busy",
            Self::DaqBusy => "DAQ Busy",
            Self::InternalTimeout => "Internal Timeout",
            Self::KeyRequest => "Key Request",
            Self::SessionStatusRequest => "Session Status Request",
            Self::ColdStartRequest => "Cold Start Request",
            Self::CmdUnknown => "Unknown Command",
            Self::CmdSyntax => "Command Syntax",
            Self::ParameterOutOfRange => "Parameter out of Range",
            Self::NoAccess => "No Access",
            Self::Overload => "Overload",
            Self::Locked => "Locked",
            Self::ResourceNotAvailable => "Resource not available",
            Self::Unknown(_) => "Unknown CCP Errorcode",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_texts() {
        assert_eq!(CcpError::from(0x33), CcpError::NoAccess);
        assert_eq!(CcpError::from(0x32).desc(), "Parameter out of Range");
        assert_eq!(CcpError::from(0x7F), CcpError::Unknown(0x7F));
        assert_eq!(CcpError::from(0x7F).desc(), "Unknown CCP Errorcode");
    }
}
