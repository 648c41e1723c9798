//! Bus status codes.
//!
//! A single error type flows through the endpoint engine, the router and
//! the topology controller. It is `Clone` so an endpoint can record its
//! disconnect cause once and hand copies to every observer.

/// Every failure the bus core can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("endpoint is closing")]
    EndpointClosing,
    #[error("endpoint was already started")]
    AlreadyStarted,
    #[error("no route to destination")]
    NoRoute,
    #[error("operation timed out")]
    Timeout,
    #[error("other end closed the connection")]
    OtherEndClosed,
    #[error("stream i/o failed: {0}")]
    Io(String),
    #[error("message signature does not match its body")]
    SignatureMismatch,
    #[error("reply serial does not match a pending call")]
    UnmatchedReplySerial,
    #[error("message time-to-live expired")]
    TimeToLiveExpired,
    #[error("invalid or replayed header serial")]
    InvalidHeaderSerial,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unique name was already assigned")]
    NameAlreadySet,
    #[error("no such endpoint")]
    NoEndpoint,
    #[error("session does not exist")]
    NoSession,
    #[error("member removed by binder")]
    RemovedByBinder,
    #[error("self-joined member removed by binder")]
    RemovedByBinderSelf,
    #[error("invalid session options")]
    BadSessionOpts,
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("operation was alerted")]
    Alerted,
    #[error("bus is stopping")]
    Stopping,
    #[error("bluetooth device is not available")]
    DeviceUnavailable,
    #[error("invalid node state: {0}")]
    InvalidNodeState(String),
    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => BusError::OtherEndClosed,
            std::io::ErrorKind::TimedOut => BusError::Timeout,
            _ => BusError::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_bus_errors() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(BusError::from(reset), BusError::OtherEndClosed);

        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(BusError::from(timed_out), BusError::Timeout);

        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(BusError::from(other), BusError::Io(msg) if msg.contains("boom")));
    }
}
