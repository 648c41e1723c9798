//! TCP transport: accepts clients and peer daemons, and dials the peers
//! named in the config.

pub mod connector;
pub mod hello;
pub mod listener;

pub use connector::PeerConnector;
pub use listener::TcpAcceptor;
