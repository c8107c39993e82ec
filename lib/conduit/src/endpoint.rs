//! The listening endpoint.
//!
//! `TcpServer` owns the lifecycle; the actual socket work happens in
//! `ServerCore`, which runs a mio poll loop on a dedicated network thread.
//! All sockets are multiplexed there, so per-socket reads are serialized by
//! construction. The owner talks to the core through a command channel plus
//! a waker, and hears back through the event channel handed out by `new`.

use crate::channel::{ChannelState, ClientChannel};
use crate::events::ServerEvent;
use crate::support::{ErrorKind, NetError, NetResult, SocketState};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use photon::codec::HEADER_SIZE;
use photon::login::{decode_login, LoginData};
use photon::logging::{self, Logger};
use photon::settings::ConnectionSettings;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const TOKEN_BASE: usize = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Behavior knobs fixed at `new` time (credentials and the allow-list can
/// also be adjusted while running).
#[derive(Clone)]
pub struct ServerOptions {
    pub credentials: Vec<LoginData>,
    pub authorization_enabled: bool,
    pub allow_all_addresses: bool,
    pub allowed_addresses: Vec<IpAddr>,
    pub auth_timeout: Duration,
    pub write_stall_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            credentials: Vec::new(),
            authorization_enabled: true,
            allow_all_addresses: true,
            allowed_addresses: Vec::new(),
            auth_timeout: Duration::from_secs(3),
            write_stall_timeout: Duration::from_secs(1),
        }
    }
}

enum Command {
    Send { peer: SocketAddr, payload: Vec<u8> },
    AddCredential(LoginData),
    RemoveCredential(LoginData),
    AddAllowedAddress(IpAddr),
    RemoveAllowedAddress(IpAddr),
    Shutdown,
}

struct LiveServer {
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

pub struct TcpServer {
    options: ServerOptions,
    log: Logger,
    event_tx: Sender<ServerEvent>,
    live: Option<LiveServer>,
}

impl TcpServer {
    /// Creates a closed endpoint and the event channel its owner will
    /// consume. The receiver stays valid across `open`/`close` cycles.
    pub fn new(options: ServerOptions, log: Logger) -> (TcpServer, Receiver<ServerEvent>) {
        let (event_tx, event_rx) = unbounded();
        let server = TcpServer {
            options,
            log,
            event_tx,
            live: None,
        };
        (server, event_rx)
    }

    /// Binds and listens synchronously, then starts the network thread.
    /// Bind/listen failure is reported both as the returned error and as an
    /// `Opened(false)` event.
    pub fn open(&mut self, settings: &ConnectionSettings) -> NetResult<()> {
        if self.live.is_some() {
            return Ok(());
        }

        let bind_addr = settings.local_addr();
        let mut listener = match TcpListener::bind(bind_addr) {
            Ok(listener) => listener,
            Err(err) => {
                logging::error!(self.log, "unable to open connection";
                                "addr" => %bind_addr, "error" => %err);
                self.emit(ServerEvent::Opened(false));
                return Err(NetError::Fatal(ErrorKind::IncorrectEndpoint));
            }
        };
        let local_addr = listener.local_addr().map_err(NetError::from)?;

        let poll = Poll::new().map_err(NetError::from)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(NetError::from)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(NetError::from)?;

        let (cmd_tx, cmd_rx) = unbounded();
        let core = ServerCore {
            listener,
            poll,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            by_peer: HashMap::new(),
            by_username: HashMap::new(),
            credentials: self.options.credentials.iter().cloned().collect(),
            authorization_enabled: self.options.authorization_enabled,
            allow_all: self.options.allow_all_addresses,
            allowed: self.options.allowed_addresses.iter().cloned().collect(),
            auth_timeout: self.options.auth_timeout,
            write_stall_timeout: self.options.write_stall_timeout,
            cmd_rx,
            event_tx: self.event_tx.clone(),
            log: self.log.new(logging::o!("local" => local_addr.to_string())),
        };

        let thread = thread::Builder::new()
            .name("conduit-server".to_string())
            .spawn(move || core.run())
            .map_err(NetError::from)?;

        self.live = Some(LiveServer {
            cmd_tx,
            waker,
            local_addr,
            thread: Some(thread),
        });

        logging::info!(self.log, "opened connection"; "local" => %local_addr);
        self.emit(ServerEvent::Opened(true));
        self.emit(ServerEvent::StateChanged(SocketState::Bound));
        Ok(())
    }

    /// Stops the network thread and closes every client socket.
    pub fn close(&mut self) {
        if let Some(mut live) = self.live.take() {
            self.emit(ServerEvent::StateChanged(SocketState::Closing));
            let _ = live.cmd_tx.send(Command::Shutdown);
            let _ = live.waker.wake();
            if let Some(thread) = live.thread.take() {
                let _ = thread.join();
            }
            logging::info!(self.log, "closed connection");
            self.emit(ServerEvent::StateChanged(SocketState::Unconnected));
        }
    }

    pub fn reopen(&mut self, settings: &ConnectionSettings) -> NetResult<()> {
        self.close();
        self.open(settings)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// Listen address actually bound (with the ephemeral port resolved).
    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.live.as_ref().map(|live| live.local_addr)
    }

    /// Frames the payload and queues it for `peer`. Returns the byte count
    /// accepted for transmission (header included).
    pub fn send(&self, peer: SocketAddr, payload: Vec<u8>) -> NetResult<usize> {
        let live = self.live.as_ref().ok_or(NetError::Fatal(ErrorKind::NotConnected))?;
        let size = HEADER_SIZE + payload.len();
        live.cmd_tx
            .send(Command::Send { peer, payload })
            .map_err(|_| NetError::Fatal(ErrorKind::Closed))?;
        let _ = live.waker.wake();
        Ok(size)
    }

    pub fn add_credential(&mut self, login: LoginData) {
        self.options.credentials.push(login.clone());
        self.command(Command::AddCredential(login));
    }

    /// Forgets a credential; the matching username's live socket, if any,
    /// is closed.
    pub fn remove_credential(&mut self, login: LoginData) {
        self.options.credentials.retain(|known| *known != login);
        self.command(Command::RemoveCredential(login));
    }

    pub fn allow_address(&mut self, ip: IpAddr) {
        self.options.allowed_addresses.push(ip);
        self.command(Command::AddAllowedAddress(ip));
    }

    /// Drops an address from the allow-list and closes its live sockets.
    pub fn disallow_address(&mut self, ip: IpAddr) {
        self.options.allowed_addresses.retain(|known| *known != ip);
        self.command(Command::RemoveAllowedAddress(ip));
    }

    fn command(&self, command: Command) {
        if let Some(live) = &self.live {
            let _ = live.cmd_tx.send(command);
            let _ = live.waker.wake();
        }
    }

    #[inline]
    fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct ServerCore {
    listener: TcpListener,
    poll: Poll,

    channels: Vec<Option<ClientChannel>>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    by_peer: HashMap<SocketAddr, usize>,
    by_username: HashMap<String, usize>,

    credentials: HashSet<LoginData>,
    authorization_enabled: bool,
    allow_all: bool,
    allowed: HashSet<IpAddr>,
    auth_timeout: Duration,
    write_stall_timeout: Duration,

    cmd_rx: Receiver<Command>,
    event_tx: Sender<ServerEvent>,
    log: Logger,
}

impl ServerCore {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);

        loop {
            match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "poll failed"; "error" => %err);
                    break;
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients(),
                    WAKER_TOKEN => {}
                    Token(raw) => {
                        self.socket_ready(raw - TOKEN_BASE, event.is_readable(), event.is_writable())
                    }
                }
            }

            if self.drain_commands() {
                break;
            }
            self.housekeeping(Instant::now());
        }

        self.shutdown_all();
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if !self.allow_all && !self.allowed.contains(&peer.ip()) {
                        logging::info!(self.log, "rejected client - not in allowed list";
                                       "peer" => %peer);
                        drop(stream);
                        continue;
                    }

                    let slot = match self.free.pop() {
                        Some(slot) => slot,
                        None => {
                            self.channels.push(None);
                            self.channels.len() - 1
                        }
                    };

                    let token = Token(TOKEN_BASE + slot);
                    if let Err(err) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        logging::error!(self.log, "stream registration failed";
                                        "peer" => %peer, "error" => %err);
                        self.free.push(slot);
                        continue;
                    }

                    let state = if self.authorization_enabled {
                        ChannelState::AwaitingLogin {
                            deadline: Instant::now() + self.auth_timeout,
                        }
                    } else {
                        ChannelState::Live { username: None }
                    };
                    self.channels[slot] = Some(ClientChannel::new(stream, peer, state, &self.log));
                    self.by_peer.insert(peer, slot);
                    self.live.insert(slot);

                    logging::info!(self.log, "client connected"; "peer" => %peer);
                    self.emit(ServerEvent::ClientConnected(peer));

                    // The socket may have become readable before it was
                    // registered; edge polling will not re-announce that.
                    self.socket_ready(slot, true, true);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    self.emit(ServerEvent::Error {
                        kind: ErrorKind::Io(err.kind()),
                        detail: err.to_string(),
                    });
                    break;
                }
            }
        }
    }

    fn socket_ready(&mut self, slot: usize, readable: bool, writable: bool) {
        if readable {
            let frames = match self.channels.get_mut(slot).and_then(Option::as_mut) {
                Some(channel) => match channel.receive() {
                    Ok(frames) => frames,
                    Err(NetError::Wait) => Vec::new(),
                    Err(NetError::Fatal(_)) => {
                        self.close_channel(slot);
                        return;
                    }
                },
                None => return,
            };

            for payload in frames {
                if !self.handle_frame(slot, payload) {
                    return;
                }
            }
        }

        if writable {
            self.flush_channel(slot);
        }
    }

    /// Routes one complete frame; returns false when the channel was closed
    /// while handling it.
    fn handle_frame(&mut self, slot: usize, payload: Vec<u8>) -> bool {
        let (peer, awaiting_login) = match self.channels.get(slot).and_then(Option::as_ref) {
            Some(channel) => (channel.peer(), !channel.is_live()),
            None => return false,
        };

        if awaiting_login {
            return self.handle_login(slot, peer, &payload);
        }

        self.emit(ServerEvent::Message { peer, payload });
        true
    }

    /// First frame on an unauthorized socket: must be a valid credential
    /// pair, unknown or duplicate logins abort the socket without a reply.
    fn handle_login(&mut self, slot: usize, peer: SocketAddr, payload: &[u8]) -> bool {
        let login = match decode_login(payload) {
            Ok(login) => login,
            Err(_) => {
                logging::info!(self.log, "received corrupted data from unauthorized client";
                               "peer" => %peer);
                self.close_channel(slot);
                return false;
            }
        };

        if self.by_username.contains_key(&login.username) {
            logging::info!(self.log, "received login data for already authorized client";
                           "peer" => %peer, "username" => %login.username);
            self.close_channel(slot);
            return false;
        }

        if !self.credentials.contains(&login) {
            logging::info!(self.log, "received invalid login data from unauthorized client";
                           "peer" => %peer);
            self.close_channel(slot);
            return false;
        }

        if let Some(channel) = self.channels.get_mut(slot).and_then(Option::as_mut) {
            channel.state = ChannelState::Live {
                username: Some(login.username.clone()),
            };
        }
        self.by_username.insert(login.username.clone(), slot);

        logging::info!(self.log, "client authorized";
                       "peer" => %peer, "username" => %login.username);
        self.emit(ServerEvent::ClientAuthorized {
            username: login.username,
            peer,
        });
        true
    }

    fn flush_channel(&mut self, slot: usize) {
        let (result, peer, pending) = match self.channels.get_mut(slot).and_then(Option::as_mut) {
            Some(channel) => {
                let peer = channel.peer();
                let result = channel.flush(Instant::now());
                let pending = channel.has_pending_write();
                (result, peer, pending)
            }
            None => return,
        };

        match result {
            Ok(written) => {
                if written > 0 && pending {
                    self.emit(ServerEvent::WrotePartial {
                        peer,
                        bytes: written,
                    });
                }
            }
            Err(NetError::Wait) => {}
            Err(NetError::Fatal(kind)) => {
                logging::info!(self.log, "write failed, closing";
                               "peer" => %peer, "kind" => ?kind);
                self.close_channel(slot);
            }
        }
    }

    fn send_to(&mut self, peer: SocketAddr, payload: Vec<u8>) {
        match self.by_peer.get(&peer).copied() {
            Some(slot) => {
                if let Some(channel) = self.channels.get_mut(slot).and_then(Option::as_mut) {
                    channel.queue_frame(&payload);
                }
                self.flush_channel(slot);
            }
            None => {
                logging::error!(self.log, "can't send message to unconnected host";
                                "peer" => %peer);
                self.emit(ServerEvent::Error {
                    kind: ErrorKind::PeerUnknown,
                    detail: peer.to_string(),
                });
            }
        }
    }

    /// Returns true when a shutdown was requested.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::Send { peer, payload }) => self.send_to(peer, payload),
                Ok(Command::AddCredential(login)) => {
                    self.credentials.insert(login);
                }
                Ok(Command::RemoveCredential(login)) => {
                    let username = login.username.clone();
                    self.credentials.remove(&login);
                    if let Some(slot) = self.by_username.get(&username).copied() {
                        logging::info!(self.log, "credential removed, closing its client";
                                       "username" => %username);
                        self.close_channel(slot);
                    }
                }
                Ok(Command::AddAllowedAddress(ip)) => {
                    self.allowed.insert(ip);
                }
                Ok(Command::RemoveAllowedAddress(ip)) => {
                    self.allowed.remove(&ip);
                    let doomed: Vec<usize> = self
                        .live
                        .iter()
                        .copied()
                        .filter(|&slot| {
                            self.channels[slot]
                                .as_ref()
                                .map_or(false, |channel| channel.peer().ip() == ip)
                        })
                        .collect();
                    for slot in doomed {
                        logging::info!(self.log, "address disallowed, closing its clients"; "ip" => %ip);
                        self.close_channel(slot);
                    }
                }
                Ok(Command::Shutdown) => return true,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let mut doomed: Vec<(usize, &'static str)> = Vec::new();

        for &slot in &self.live {
            if let Some(channel) = self.channels[slot].as_ref() {
                match channel.state {
                    ChannelState::AwaitingLogin { deadline } if now >= deadline => {
                        doomed.push((slot, "login timeout"));
                    }
                    _ => {
                        if channel.write_stalled(now, self.write_stall_timeout) {
                            doomed.push((slot, "write stalled"));
                        }
                    }
                }
            }
        }

        for (slot, reason) in doomed {
            if let Some(channel) = self.channels[slot].as_ref() {
                logging::info!(self.log, "closing client"; "peer" => %channel.peer(), "reason" => reason);
            }
            self.close_channel(slot);
        }
    }

    fn close_channel(&mut self, slot: usize) {
        if let Some(mut channel) = self.channels.get_mut(slot).and_then(Option::take) {
            let _ = self.poll.registry().deregister(channel.stream_mut());
            let peer = channel.peer();

            self.by_peer.remove(&peer);
            if let Some(username) = channel.username() {
                self.by_username.remove(username);
            }
            self.live.swap_remove(&slot);
            self.free.push(slot);

            if channel.is_live() {
                logging::info!(self.log, "client disconnected";
                               "peer" => %peer,
                               "username" => channel.username().unwrap_or(""));
                self.emit(ServerEvent::ClientDisconnected(peer));
            } else {
                logging::info!(self.log, "disconnected unauthorized client"; "peer" => %peer);
            }

            channel.shutdown();
        }
    }

    fn shutdown_all(&mut self) {
        let slots: Vec<usize> = self.live.iter().copied().collect();
        for slot in slots {
            self.close_channel(slot);
        }
        self.emit(ServerEvent::Closed);
    }

    #[inline]
    fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}
