//! Network transport between a recording host and `recv`.
//!
//! - [`protocol`]: length-prefixed JSON frames
//! - [`receiver`]: listener that materializes sessions on disk
//! - [`sender`]: transmits an existing session directory

pub mod protocol;
pub mod receiver;
pub mod sender;

pub use protocol::Message;
pub use receiver::{Connection, Receiver, RegistryTable};
pub use sender::{connect_and_send, send_session};
