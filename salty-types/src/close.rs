//! WebSocket close codes used by the relay.

use std::fmt;

/// Close codes sent in WebSocket close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Server is going away.
    GoingAway = 1001,
    /// No shared subprotocol.
    SubprotocolError = 1002,
    /// Message exceeded the size limit.
    MessageTooBig = 1009,
    /// No free responder slot on the path.
    PathFull = 3000,
    /// Protocol violation.
    ProtocolError = 3001,
    /// Server-side failure.
    InternalError = 3002,
    /// Connection handed over to the peer-to-peer channel.
    Handover = 3003,
    /// Dropped by the initiator.
    DropByInitiator = 3004,
    /// Initiator could not decrypt a message.
    InitiatorCouldNotDecrypt = 3005,
    /// No shared task.
    NoSharedTasks = 3006,
    /// Requested permanent key is unknown.
    InvalidKey = 3007,
    /// Timed out.
    Timeout = 3008,
}

impl CloseCode {
    /// Numeric value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a known close code.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::SubprotocolError,
            1009 => Self::MessageTooBig,
            3000 => Self::PathFull,
            3001 => Self::ProtocolError,
            3002 => Self::InternalError,
            3003 => Self::Handover,
            3004 => Self::DropByInitiator,
            3005 => Self::InitiatorCouldNotDecrypt,
            3006 => Self::NoSharedTasks,
            3007 => Self::InvalidKey,
            3008 => Self::Timeout,
            _ => return None,
        })
    }

    /// Codes an initiator may give as a `drop-responder` reason.
    pub fn is_valid_drop_reason(self) -> bool {
        matches!(
            self,
            Self::ProtocolError
                | Self::InternalError
                | Self::DropByInitiator
                | Self::InitiatorCouldNotDecrypt
        )
    }

    /// Short reason text for the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::SubprotocolError => "no shared subprotocol",
            Self::MessageTooBig => "message too big",
            Self::PathFull => "path full",
            Self::ProtocolError => "protocol error",
            Self::InternalError => "internal error",
            Self::Handover => "handover",
            Self::DropByInitiator => "dropped by initiator",
            Self::InitiatorCouldNotDecrypt => "initiator could not decrypt",
            Self::NoSharedTasks => "no shared tasks",
            Self::InvalidKey => "invalid key",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}
