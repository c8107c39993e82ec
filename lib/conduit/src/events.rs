use crate::support::{ErrorKind, SocketState};
use std::net::SocketAddr;

/// Events emitted by the server endpoint to its owner.
#[derive(Debug)]
pub enum ServerEvent {
    /// Result of an `open()` attempt.
    Opened(bool),
    StateChanged(SocketState),
    /// A socket was accepted (it may still be unauthorized).
    ClientConnected(SocketAddr),
    /// An authorized socket went away.
    ClientDisconnected(SocketAddr),
    ClientAuthorized {
        username: String,
        peer: SocketAddr,
    },
    /// A complete frame arrived from an authorized client.
    Message {
        peer: SocketAddr,
        payload: Vec<u8>,
    },
    /// A flush moved bytes but left a remainder queued; lets observers
    /// witness partial writes under backpressure.
    WrotePartial {
        peer: SocketAddr,
        bytes: usize,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
    Closed,
}

/// Events emitted by the client endpoint to its owner.
#[derive(Debug)]
pub enum ClientEvent {
    /// Result of a connect attempt.
    Opened(bool),
    StateChanged(SocketState),
    Connected,
    Disconnected,
    /// A complete frame arrived from the server.
    Message { payload: Vec<u8> },
    WrotePartial { bytes: usize },
    Error { kind: ErrorKind, detail: String },
}
