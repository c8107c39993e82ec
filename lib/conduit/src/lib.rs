//! Framed TCP endpoints for the compute protocol.
//!
//! The server multiplexes every socket on one poll loop running on a
//! dedicated network thread; the client drives a single blocking socket with
//! a reader thread. Both sides speak length-prefixed frames reassembled by
//! [`assembler::FrameAssembler`] and report their lifecycle through event
//! channels.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod assembler;
mod channel;
pub mod client;
pub mod endpoint;
pub mod events;
pub mod support;

pub use crate::client::TcpClient;
pub use crate::endpoint::{ServerOptions, TcpServer};
pub use crate::events::{ClientEvent, ServerEvent};
pub use crate::support::{ErrorKind, NetError, NetResult, SocketState};
