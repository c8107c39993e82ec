//! Per-socket state on the server side: the stream, frame reassembly, the
//! write queue and the authorization state.

use crate::assembler::FrameAssembler;
use crate::support::{ErrorKind, NetError, NetResult};
use byteorder::WriteBytesExt;
use mio::net::TcpStream;
use photon::codec::NetOrder;
use photon::logging::{self, Logger};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

const READ_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum ChannelState {
    /// Accepted but not yet authorized; closed when `deadline` passes.
    AwaitingLogin { deadline: Instant },
    /// Authorized (or accepted with authorization disabled).
    Live { username: Option<String> },
}

/// Write queue for one socket. Frames are queued whole; `flush` pushes bytes
/// until the socket refuses more.
struct WriteBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl WriteBuffer {
    fn new() -> WriteBuffer {
        WriteBuffer {
            data: Vec::new(),
            pos: 0,
        }
    }

    fn queue_frame(&mut self, payload: &[u8]) {
        self.data.reserve(payload.len() + photon::codec::HEADER_SIZE);
        self.data
            .write_u32::<NetOrder>(payload.len() as u32)
            .expect("infallible write into Vec");
        self.data.extend_from_slice(payload);
    }

    fn has_pending(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Writes as much as the socket accepts. Returns the byte count moved;
    /// `WouldBlock` ends the attempt without error.
    fn flush<W: Write>(&mut self, writer: &mut W) -> NetResult<usize> {
        let mut written = 0;
        while self.has_pending() {
            match writer.write(&self.data[self.pos..]) {
                Ok(0) => return Err(NetError::Fatal(ErrorKind::Io(io::ErrorKind::WriteZero))),
                Ok(count) => {
                    self.pos += count;
                    written += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if !self.has_pending() {
            self.data.clear();
            self.pos = 0;
        }
        Ok(written)
    }
}

pub(crate) struct ClientChannel {
    stream: TcpStream,
    peer: SocketAddr,
    pub(crate) state: ChannelState,
    assembler: FrameAssembler,
    write_buf: WriteBuffer,
    /// Last time a flush made progress (or found nothing queued); drives
    /// the write-stall disconnect.
    last_write_progress: Instant,
    log: Logger,
}

impl ClientChannel {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        state: ChannelState,
        log: &Logger,
    ) -> ClientChannel {
        ClientChannel {
            stream,
            peer,
            state,
            assembler: FrameAssembler::new(),
            write_buf: WriteBuffer::new(),
            last_write_progress: Instant::now(),
            log: log.new(logging::o!("peer" => peer.to_string())),
        }
    }

    #[inline]
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        match self.state {
            ChannelState::Live { .. } => true,
            _ => false,
        }
    }

    #[inline]
    pub(crate) fn username(&self) -> Option<&str> {
        match &self.state {
            ChannelState::Live { username } => username.as_deref(),
            _ => None,
        }
    }

    /// Reads everything available and returns the frames completed by it.
    /// `Fatal(Closed)` reports an orderly peer shutdown.
    pub(crate) fn receive(&mut self) -> NetResult<Vec<Vec<u8>>> {
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut frames = Vec::new();

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    logging::debug!(self.log, "peer closed the connection");
                    return Err(NetError::Fatal(ErrorKind::Closed));
                }
                Ok(count) => frames.extend(self.assembler.push(&buf[..count])?),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::debug!(self.log, "read failed"; "error" => %err);
                    return Err(err.into());
                }
            }
        }

        Ok(frames)
    }

    pub(crate) fn queue_frame(&mut self, payload: &[u8]) {
        self.write_buf.queue_frame(payload);
    }

    #[inline]
    pub(crate) fn has_pending_write(&self) -> bool {
        self.write_buf.has_pending()
    }

    /// Flushes queued bytes and advances the stall clock on progress.
    pub(crate) fn flush(&mut self, now: Instant) -> NetResult<usize> {
        let written = self.write_buf.flush(&mut self.stream)?;
        if written > 0 || !self.write_buf.has_pending() {
            self.last_write_progress = now;
        }
        Ok(written)
    }

    /// True once queued bytes have sat unmoved longer than `limit`.
    pub(crate) fn write_stalled(&self, now: Instant, limit: Duration) -> bool {
        self.write_buf.has_pending() && now.duration_since(self.last_write_progress) >= limit
    }

    /// Tears the socket down; errors are irrelevant at this point.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
