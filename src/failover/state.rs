//! The failover state machine.

use enum_iterator::Sequence;

/// States of the ISC-style failover protocol, numbered as they
/// travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum FailoverState {
    Startup,
    RecoverWait,
    RecoverDone,
    PotentialConflict,
    Normal,
    CommunicationsInterrupted,
    PartnerDown,
    Recover,
    Paused,
    Shutdown,
    Conflict,
    ConflictDone,
}

impl FailoverState {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Startup),
            1 => Some(Self::RecoverWait),
            2 => Some(Self::RecoverDone),
            3 => Some(Self::PotentialConflict),
            4 => Some(Self::Normal),
            5 => Some(Self::CommunicationsInterrupted),
            6 => Some(Self::PartnerDown),
            7 => Some(Self::Recover),
            8 => Some(Self::Paused),
            9 => Some(Self::Shutdown),
            10 => Some(Self::Conflict),
            11 => Some(Self::ConflictDone),
            _ => None,
        }
    }

    pub fn wire(&self) -> u8 {
        match self {
            Self::Startup => 0,
            Self::RecoverWait => 1,
            Self::RecoverDone => 2,
            Self::PotentialConflict => 3,
            Self::Normal => 4,
            Self::CommunicationsInterrupted => 5,
            Self::PartnerDown => 6,
            Self::Recover => 7,
            Self::Paused => 8,
            Self::Shutdown => 9,
            Self::Conflict => 10,
            Self::ConflictDone => 11,
        }
    }

    /// Whether the server answers clients at all in this state.
    pub fn can_serve(&self) -> bool {
        matches!(
            self,
            Self::Normal | Self::PartnerDown | Self::CommunicationsInterrupted
        )
    }
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
