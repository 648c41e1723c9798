//! Shared types for the Junction bus daemon: the message envelope and
//! frame codec, bus GUIDs, session options and reply codes, the bus error
//! type and configuration.

pub mod config;
pub mod error;
pub mod guid;
pub mod message;
pub mod session;

pub use error::BusError;
pub use guid::Guid128;
pub use message::{Header, Message, MessageType, WireCodec};
pub use session::{SessionId, SessionOpts, SessionPort};
