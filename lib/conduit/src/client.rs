//! The connecting endpoint.
//!
//! One blocking socket driven by a session thread: connect (bounded wait),
//! send the login frame, then read and reassemble frames until the
//! connection drops. When reconnection is enabled the session thread sleeps
//! `reconnect_interval` and tries again; `close()` interrupts the wait.

use crate::assembler::FrameAssembler;
use crate::events::ClientEvent;
use crate::support::{ErrorKind, NetError, NetResult, SocketState};
use byteorder::WriteBytesExt;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use photon::codec::{NetOrder, HEADER_SIZE};
use photon::login::{encode_login, LoginData};
use photon::logging::{self, Logger};
use photon::settings::ConnectionSettings;
use socket2::{Domain, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_BUF_SIZE: usize = 65536;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

struct ClientShared {
    stream: Mutex<Option<TcpStream>>,
    closing: AtomicBool,
    state: Mutex<SocketState>,
}

impl ClientShared {
    fn set_state(&self, state: SocketState, event_tx: &Sender<ClientEvent>) {
        *self.state.lock().expect("state lock") = state;
        let _ = event_tx.send(ClientEvent::StateChanged(state));
    }
}

struct Session {
    thread: JoinHandle<()>,
    stop_tx: Sender<()>,
}

pub struct TcpClient {
    login: Option<LoginData>,
    reconnect_enabled: bool,
    reconnect_interval: Duration,
    wait_for_connected: Duration,

    shared: Arc<ClientShared>,
    event_tx: Sender<ClientEvent>,
    session: Option<Session>,
    log: Logger,
}

impl TcpClient {
    /// Creates a closed client and the event channel its owner will consume.
    pub fn new(log: Logger) -> (TcpClient, Receiver<ClientEvent>) {
        let (event_tx, event_rx) = unbounded();
        let client = TcpClient {
            login: None,
            reconnect_enabled: false,
            reconnect_interval: Duration::from_secs(60),
            wait_for_connected: Duration::from_secs(10),
            shared: Arc::new(ClientShared {
                stream: Mutex::new(None),
                closing: AtomicBool::new(false),
                state: Mutex::new(SocketState::Unconnected),
            }),
            event_tx,
            session: None,
            log,
        };
        (client, event_rx)
    }

    /// Credentials sent as the first frame after every connect. Changing
    /// them while the connection is open is forbidden.
    pub fn set_login_data(&mut self, login: LoginData) {
        if self.session.is_some() {
            logging::info!(self.log, "called set_login_data while connection is open - action forbidden");
            return;
        }
        self.login = Some(login);
    }

    pub fn set_reconnect(&mut self, enabled: bool) {
        self.reconnect_enabled = enabled;
    }

    pub fn set_wait_times(&mut self, reconnect_interval: Duration, wait_for_connected: Duration) {
        self.reconnect_interval = reconnect_interval;
        self.wait_for_connected = wait_for_connected;
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        *self.shared.state.lock().expect("state lock")
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    /// Starts the session thread. Fails synchronously when the settings
    /// name no destination or the requested local bind is unusable; the
    /// connect attempt itself is reported through `Opened` events.
    pub fn open(&mut self, settings: &ConnectionSettings) -> NetResult<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let destination = match settings.destination_addr() {
            Some(addr) => addr,
            None => {
                logging::error!(self.log, "unable to open connection - no destination address");
                let _ = self.event_tx.send(ClientEvent::Opened(false));
                return Err(NetError::Fatal(ErrorKind::IncorrectEndpoint));
            }
        };

        // Probe the local bind now so the caller hears about a bad address
        // synchronously; each connect attempt re-binds.
        if settings.wants_local_bind() {
            if let Err(err) = bound_socket(settings, destination) {
                logging::error!(self.log, "failed to open connection"; "error" => %err);
                let _ = self.event_tx.send(ClientEvent::Opened(false));
                return Err(NetError::Fatal(ErrorKind::IncorrectEndpoint));
            }
        }

        self.shared.closing.store(false, Ordering::SeqCst);

        let (stop_tx, stop_rx) = bounded(1);
        let worker = SessionWorker {
            settings: settings.clone(),
            destination,
            login: self.login.clone(),
            reconnect_enabled: self.reconnect_enabled,
            reconnect_interval: self.reconnect_interval,
            wait_for_connected: self.wait_for_connected,
            shared: Arc::clone(&self.shared),
            event_tx: self.event_tx.clone(),
            stop_rx,
            log: self.log.new(logging::o!("destination" => destination.to_string())),
        };

        let thread = thread::Builder::new()
            .name("conduit-client".to_string())
            .spawn(move || worker.run())
            .map_err(NetError::from)?;

        self.session = Some(Session { thread, stop_tx });
        Ok(())
    }

    /// Frames the payload and writes it to the server. Returns the byte
    /// count handed to the socket. A write that stalls past the 1 s bound
    /// tears the connection down.
    pub fn send(&self, payload: &[u8]) -> NetResult<usize> {
        let mut guard = self.shared.stream.lock().expect("stream lock");
        let stream = guard.as_mut().ok_or(NetError::Fatal(ErrorKind::NotConnected))?;

        let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
        framed
            .write_u32::<NetOrder>(payload.len() as u32)
            .expect("infallible write into Vec");
        framed.extend_from_slice(payload);

        match write_frame(stream, &framed, &self.event_tx) {
            Ok(()) => Ok(framed.len()),
            Err(err) => {
                // Framing integrity is gone on a partial write, drop the
                // connection and let the reader thread observe it.
                let _ = stream.shutdown(Shutdown::Both);
                *guard = None;
                Err(err)
            }
        }
    }

    /// Closes the connection and stops the session thread. Reconnection is
    /// not attempted after an explicit close.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.shared.set_state(SocketState::Closing, &self.event_tx);
            self.shared.closing.store(true, Ordering::SeqCst);
            let _ = session.stop_tx.send(());
            if let Some(stream) = self.shared.stream.lock().expect("stream lock").take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            let _ = session.thread.join();
            logging::info!(self.log, "closed connection");
            self.shared.set_state(SocketState::Unconnected, &self.event_tx);
        }
    }

    pub fn reopen(&mut self, settings: &ConnectionSettings) -> NetResult<()> {
        self.close();
        self.open(settings)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionWorker {
    settings: ConnectionSettings,
    destination: SocketAddr,
    login: Option<LoginData>,
    reconnect_enabled: bool,
    reconnect_interval: Duration,
    wait_for_connected: Duration,
    shared: Arc<ClientShared>,
    event_tx: Sender<ClientEvent>,
    stop_rx: Receiver<()>,
    log: Logger,
}

impl SessionWorker {
    fn run(self) {
        loop {
            if self.shared.closing.load(Ordering::SeqCst) {
                break;
            }

            self.shared.set_state(SocketState::Connecting, &self.event_tx);
            match self.connect() {
                Ok(stream) => {
                    logging::info!(self.log, "connected to server";
                                   "local" => %stream.local_addr().map(|a| a.to_string()).unwrap_or_default());
                    let _ = self.event_tx.send(ClientEvent::Opened(true));

                    self.serve_connection(stream);

                    self.shared.set_state(SocketState::Unconnected, &self.event_tx);
                    let _ = self.event_tx.send(ClientEvent::Disconnected);
                    logging::info!(self.log, "disconnected from server");
                }
                Err(err) => {
                    logging::info!(self.log, "connect attempt failed"; "error" => %err);
                    let _ = self.event_tx.send(ClientEvent::Opened(false));
                    self.shared.set_state(SocketState::Unconnected, &self.event_tx);
                }
            }

            if self.shared.closing.load(Ordering::SeqCst) || !self.reconnect_enabled {
                break;
            }
            match self.stop_rx.recv_timeout(self.reconnect_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let stream = if self.settings.wants_local_bind() {
            let socket = bound_socket(&self.settings, self.destination)?;
            socket.connect_timeout(&self.destination.into(), self.wait_for_connected)?;
            socket.into()
        } else {
            TcpStream::connect_timeout(&self.destination, self.wait_for_connected)?
        };
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(stream)
    }

    /// Sends the login frame, publishes the stream for writers, announces
    /// the connection, then reads until it drops. The login frame goes out
    /// before the stream is visible to `send()` so it stays first on the
    /// socket.
    fn serve_connection(&self, stream: TcpStream) {
        let mut reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                logging::error!(self.log, "stream clone failed"; "error" => %err);
                return;
            }
        };

        if let Some(login) = &self.login {
            let framed = photon::codec::frame(&encode_login(login));
            let mut writable = &stream;
            if let Err(err) = writable.write_all(&framed) {
                logging::info!(self.log, "login write failed"; "error" => %err);
                return;
            }
        }

        *self.shared.stream.lock().expect("stream lock") = Some(stream);
        self.shared.set_state(SocketState::Connected, &self.event_tx);
        let _ = self.event_tx.send(ClientEvent::Connected);

        let mut assembler = FrameAssembler::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(count) => match assembler.push(&buf[..count]) {
                    Ok(frames) => {
                        for payload in frames {
                            let _ = self.event_tx.send(ClientEvent::Message { payload });
                        }
                    }
                    Err(err) => {
                        logging::info!(self.log, "frame error, dropping connection"; "error" => ?err);
                        let _ = self.event_tx.send(ClientEvent::Error {
                            kind: ErrorKind::PayloadTooLarge,
                            detail: format!("{:?}", err),
                        });
                        break;
                    }
                },
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::debug!(self.log, "read failed"; "error" => %err);
                    break;
                }
            }
        }

        if let Some(stream) = self.shared.stream.lock().expect("stream lock").take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Creates a socket bound to the requested local address.
fn bound_socket(settings: &ConnectionSettings, destination: SocketAddr) -> io::Result<Socket> {
    let domain = if destination.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(settings.ip_local, settings.port_in).into())?;
    Ok(socket)
}

/// Writes a whole frame, reporting partial progress to observers. The 1 s
/// socket write timeout bounds each chunk.
fn write_frame(
    stream: &mut TcpStream,
    framed: &[u8],
    event_tx: &Sender<ClientEvent>,
) -> NetResult<()> {
    let mut offset = 0;
    while offset < framed.len() {
        match stream.write(&framed[offset..]) {
            Ok(0) => return Err(NetError::Fatal(ErrorKind::Io(io::ErrorKind::WriteZero))),
            Ok(count) => {
                offset += count;
                if offset < framed.len() {
                    let _ = event_tx.send(ClientEvent::WrotePartial { bytes: count });
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(NetError::Fatal(ErrorKind::WriteStalled));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
