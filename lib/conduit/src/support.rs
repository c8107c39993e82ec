use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level network error: `Wait` means the operation should be retried
/// when the socket is ready again, `Fatal` means the connection is beyond
/// saving.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Bind or listen failed, or the settings name no usable endpoint.
    IncorrectEndpoint,
    /// The peer closed the connection.
    Closed,
    /// Operation requires a connected socket.
    NotConnected,
    /// The target address has no live socket.
    PeerUnknown,
    /// A frame announced a length beyond the accepted maximum.
    PayloadTooLarge,
    /// A write made no progress within the backpressure bound.
    WriteStalled,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

/// Socket lifecycle state carried by state-change events.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    Bound,
    Closing,
}
