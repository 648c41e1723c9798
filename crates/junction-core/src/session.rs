//! Session types, options and reply codes.
//!
//! Reply codes keep the numeric values peers exchange on the wire, so
//! every enum here is `#[repr(u32)]` with explicit discriminants.

use serde::{Deserialize, Serialize};

use crate::error::BusError;

pub type SessionId = u32;
pub type SessionPort = u16;

/// Ask the daemon to pick a free port.
pub const SESSION_PORT_ANY: SessionPort = 0;

/// First port handed out for `SESSION_PORT_ANY`.
pub const FIRST_EPHEMERAL_PORT: SessionPort = 10000;

/// Protocol version this daemon speaks.
pub const PROTOCOL_VERSION: u32 = 12;

/// Lowest protocol version that understands self-joined sessions.
pub const SELF_JOIN_MIN_PROTOCOL: u32 = 11;

/// Traffic type bits.
pub mod traffic {
    pub const MESSAGES: u8 = 0x01;
    pub const RAW_UNRELIABLE: u8 = 0x02;
    pub const RAW_RELIABLE: u8 = 0x04;
}

/// Proximity bits.
pub mod proximity {
    pub const PHYSICAL: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const ANY: u8 = 0xFF;
}

/// Transport mask bits.
pub mod transport {
    pub type TransportMask = u16;

    pub const NONE: TransportMask = 0x0000;
    pub const LOCAL: TransportMask = 0x0001;
    pub const BLUETOOTH: TransportMask = 0x0002;
    pub const TCP: TransportMask = 0x0004;
    pub const WFD: TransportMask = 0x0080;
    pub const ANY: TransportMask = 0xFFFF;
}

use transport::TransportMask;

/// Negotiated session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpts {
    pub traffic: u8,
    pub is_multipoint: bool,
    pub proximity: u8,
    pub transports: TransportMask,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: traffic::MESSAGES,
            is_multipoint: false,
            proximity: proximity::ANY,
            transports: transport::ANY,
        }
    }
}

impl SessionOpts {
    pub fn multipoint() -> Self {
        Self {
            is_multipoint: true,
            ..Self::default()
        }
    }

    /// Options a host may bind with.
    pub fn is_valid_for_bind(&self) -> bool {
        if self.traffic == traffic::RAW_UNRELIABLE {
            return false;
        }
        !(self.traffic == traffic::RAW_RELIABLE && self.is_multipoint)
    }

    /// Two option sets are compatible when transports, traffic and
    /// proximity all overlap. Multipoint is not a compatibility condition.
    pub fn is_compatible(&self, other: &SessionOpts) -> bool {
        (self.transports & other.transports) != 0
            && (self.traffic & other.traffic) != 0
            && (self.proximity & other.proximity) != 0
    }

    /// Host options narrowed to what the joiner asked for.
    pub fn negotiate(&self, joiner: &SessionOpts) -> SessionOpts {
        SessionOpts {
            traffic: self.traffic & joiner.traffic,
            is_multipoint: self.is_multipoint,
            proximity: self.proximity & joiner.proximity,
            transports: self.transports & joiner.transports,
        }
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn code(self) -> u32 {
                self as u32
            }

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(BindReply {
    Success = 1,
    AlreadyExists = 2,
    Failed = 3,
    InvalidOpts = 4,
});

wire_enum!(UnbindReply {
    Success = 1,
    BadPort = 2,
    Failed = 3,
});

wire_enum!(JoinReply {
    Success = 1,
    NoSession = 2,
    Unreachable = 3,
    ConnectFailed = 4,
    Rejected = 5,
    BadSessionOpts = 6,
    AlreadyJoined = 7,
    Failed = 10,
});

wire_enum!(LeaveReply {
    Success = 1,
    NoSession = 2,
    Failed = 3,
});

wire_enum!(RemoveMemberReply {
    Success = 1,
    NoSession = 2,
    NotBinder = 3,
    NotMultipoint = 4,
    NotFound = 5,
    IncompatibleRemoteDaemon = 6,
    Failed = 7,
});

wire_enum!(AdvertiseReply {
    Success = 1,
    AlreadyAdvertising = 2,
    Failed = 3,
    TransportNotAvailable = 4,
});

wire_enum!(CancelAdvertiseReply {
    Success = 1,
    Failed = 2,
});

wire_enum!(FindReply {
    Success = 1,
    AlreadyDiscovering = 2,
    Failed = 3,
    TransportNotAvailable = 4,
});

wire_enum!(CancelFindReply {
    Success = 1,
    Failed = 2,
});

wire_enum!(
    /// Why a session was lost.
    SessionLostReason {
        Invalid = 0,
        RemoteEndLeft = 1,
        RemoteEndClosedAbruptly = 2,
        RemovedByBinder = 3,
        LinkTimeout = 4,
        Other = 5,
        RemovedByBinderSelf = 6,
    }
);

wire_enum!(
    /// Which side of the session the receiver of `SessionLost` was on.
    SessionLostDisposition {
        Host = 0,
        Member = 1,
    }
);

wire_enum!(MpSessionChangeReason {
    LocalMemberAdded = 0,
    RemoteMemberAdded = 1,
    LocalMemberRemoved = 2,
    RemoteMemberRemoved = 3,
});

impl SessionLostReason {
    /// Map an endpoint disconnect status to the reason reported to
    /// surviving members. `None` is an orderly departure.
    pub fn from_status(status: Option<&BusError>) -> Self {
        match status {
            None => SessionLostReason::RemoteEndLeft,
            Some(BusError::OtherEndClosed) | Some(BusError::EndpointClosing) => {
                SessionLostReason::RemoteEndClosedAbruptly
            }
            Some(BusError::RemovedByBinder) => SessionLostReason::RemovedByBinder,
            Some(BusError::RemovedByBinderSelf) => SessionLostReason::RemovedByBinderSelf,
            Some(BusError::Timeout) => SessionLostReason::LinkTimeout,
            Some(_) => SessionLostReason::Other,
        }
    }
}
