//! Client side of peer discovery: the rendezvous link, the
//! `CONNECT_REQUEST` negotiation and the inbound request listener.

use std::fmt;
use std::net::SocketAddr;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, ProtocolError, Result};
use crate::networking::{connect, read_line, write_line};
use crate::protocol::{PeerMessage, PeerRecord, ServerCommand, ServerLine};
use crate::MAX_LINE_LEN;

/// Where the client stands in the discovery/negotiation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    Registered,
    Idle,
    Negotiating,
    InSession,
}

impl ClientState {
    /// A busy client answers every inbound request with `DENY`.
    pub fn is_busy(self) -> bool {
        matches!(self, ClientState::Negotiating | ClientState::InSession)
    }
}

/// Something the rendezvous server told us, after line reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Full replacement of the cached peer list.
    PeerList(Vec<PeerRecord>),
    NewPeer(String),
    UsernameTaken,
    InvalidCommand,
    ServerFull,
    Notice(String),
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::PeerList(peers) => write!(f, "peer list of {} entries", peers.len()),
            ServerEvent::NewPeer(username) => write!(f, "new peer {}", username),
            ServerEvent::UsernameTaken => f.write_str("username taken"),
            ServerEvent::InvalidCommand => f.write_str("invalid command"),
            ServerEvent::ServerFull => f.write_str("server full"),
            ServerEvent::Notice(text) => f.write_str(text),
        }
    }
}

/// Folds server lines into [`ServerEvent`]s. A `PEER_LIST` header opens a new
/// list; each peer line that follows extends it and yields the whole list.
#[derive(Debug, Default)]
pub struct PeerListAssembler {
    current: Option<Vec<PeerRecord>>,
}

impl PeerListAssembler {
    pub fn push(&mut self, line: ServerLine) -> Option<ServerEvent> {
        match line {
            ServerLine::PeerListHeader => {
                self.current = Some(Vec::new());
                Some(ServerEvent::PeerList(Vec::new()))
            }
            ServerLine::Peer(record) => match self.current.as_mut() {
                Some(list) => {
                    list.push(record);
                    Some(ServerEvent::PeerList(list.clone()))
                }
                None => Some(ServerEvent::Notice(record.to_string())),
            },
            other => {
                self.current = None;
                match other {
                    ServerLine::NewPeer(username) => Some(ServerEvent::NewPeer(username)),
                    ServerLine::UsernameTaken => Some(ServerEvent::UsernameTaken),
                    ServerLine::InvalidCommand => Some(ServerEvent::InvalidCommand),
                    ServerLine::ServerFull => Some(ServerEvent::ServerFull),
                    ServerLine::Other(text) if text.trim().is_empty() => None,
                    ServerLine::Other(text) => Some(ServerEvent::Notice(text)),
                    ServerLine::PeerListHeader | ServerLine::Peer(_) => None,
                }
            }
        }
    }
}

/// A rendezvous connection that has not registered yet.
pub struct RendezvousConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub enum Registration {
    Registered(RendezvousLink),
    /// The connection stays open so another name can be tried on it.
    UsernameTaken(RendezvousConnection),
    Rejected(ServerEvent),
}

impl RendezvousConnection {
    pub async fn connect(server: &str) -> Result<Self> {
        let stream = connect(server).await?;
        let (read_half, writer) = stream.into_split();
        Ok(RendezvousConnection {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    pub async fn register(mut self, username: &str, listen_port: u16) -> Result<Registration> {
        let command = ServerCommand::Register {
            username: username.to_string(),
            port: listen_port,
        };
        write_line(&mut self.writer, &command.to_line()).await?;

        loop {
            let line = read_line(&mut self.reader, MAX_LINE_LEN)
                .await?
                .ok_or(Error::PeerClosed)?;
            match ServerLine::parse(&line) {
                ServerLine::PeerListHeader => {
                    info!("Registered as {} (listening on {})", username, listen_port);
                    return Ok(Registration::Registered(RendezvousLink::start(
                        username.to_string(),
                        self,
                    )));
                }
                ServerLine::UsernameTaken => return Ok(Registration::UsernameTaken(self)),
                ServerLine::InvalidCommand => {
                    return Ok(Registration::Rejected(ServerEvent::InvalidCommand))
                }
                ServerLine::ServerFull => return Ok(Registration::Rejected(ServerEvent::ServerFull)),
                // A broadcast can race ahead of our reply.
                ServerLine::NewPeer(other) => debug!("Ignoring early notice for {}", other),
                other => return Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into()),
            }
        }
    }
}

/// A registered rendezvous connection. Server lines are read by a background
/// task and surfaced through [`RendezvousLink::next_event`]; dropping the link
/// stops that task.
pub struct RendezvousLink {
    username: String,
    writer: OwnedWriteHalf,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    listener: JoinHandle<()>,
}

impl RendezvousLink {
    fn start(username: String, connection: RendezvousConnection) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        // The header has already been consumed by `register`.
        let mut assembler = PeerListAssembler::default();
        let pending = match assembler.push(ServerLine::PeerListHeader) {
            Some(ServerEvent::PeerList(peers)) => Some(peers),
            _ => None,
        };
        let listener = tokio::spawn(listen_to_server(
            connection.reader,
            assembler,
            pending,
            events_tx,
        ));
        RendezvousLink {
            username,
            writer: connection.writer,
            events,
            listener,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `None` once the server connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub async fn request_peer_list(&mut self) -> Result<()> {
        write_line(&mut self.writer, &ServerCommand::GetPeerList.to_line()).await
    }

    pub async fn report_unreachable(&mut self, username: &str) -> Result<()> {
        let command = ServerCommand::PeerDisconnected {
            username: username.to_string(),
        };
        write_line(&mut self.writer, &command.to_line()).await
    }

    /// Sends `REMOVE <self>` and closes the connection.
    pub async fn withdraw(mut self) -> Result<()> {
        self.listener.abort();
        let command = ServerCommand::Remove {
            username: self.username.clone(),
        };
        write_line(&mut self.writer, &command.to_line()).await?;
        self.writer.shutdown().await?;
        debug!("Withdrew {} from the discoverable list", self.username);
        Ok(())
    }
}

impl Drop for RendezvousLink {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Peer lines that arrived in the same read are folded into one update.
async fn listen_to_server(
    mut reader: BufReader<OwnedReadHalf>,
    mut assembler: PeerListAssembler,
    mut pending: Option<Vec<PeerRecord>>,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    loop {
        if pending.is_some() && !reader.buffer().contains(&b'\n') {
            if let Some(peers) = pending.take() {
                if events.send(ServerEvent::PeerList(peers)).is_err() {
                    return;
                }
            }
        }
        let line = match read_line(&mut reader, MAX_LINE_LEN).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Rendezvous server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Rendezvous connection failed: {}", e);
                break;
            }
        };
        match assembler.push(ServerLine::parse(&line)) {
            Some(ServerEvent::PeerList(peers)) => pending = Some(peers),
            Some(event) => {
                if let Some(peers) = pending.take() {
                    let _ = events.send(ServerEvent::PeerList(peers));
                }
                if events.send(event).is_err() {
                    return;
                }
            }
            None => {}
        }
    }
    if let Some(peers) = pending {
        let _ = events.send(ServerEvent::PeerList(peers));
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("you cannot connect to yourself")]
    SelfDial,
    #[error("no peer named {0:?} in the current list")]
    UnknownPeer(String),
}

/// Resolves a chat target against the cached list. Runs before any socket
/// is opened, so choosing yourself never dials.
pub fn resolve_target(
    peers: &[PeerRecord],
    local_username: &str,
    target: &str,
) -> std::result::Result<SocketAddr, TargetError> {
    if target == local_username {
        return Err(TargetError::SelfDial);
    }
    peers
        .iter()
        .find(|peer| peer.username == target)
        .map(|peer| SocketAddr::new(peer.address, peer.listen_port))
        .ok_or_else(|| TargetError::UnknownPeer(target.to_string()))
}

/// Parses anonymous-mode input of the form `<ip> <port>`.
pub fn parse_direct_target(input: &str) -> std::result::Result<SocketAddr, ProtocolError> {
    let mut parts = input.split_whitespace();
    let (Some(ip), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProtocolError::Malformed {
            command: "direct target",
        });
    };
    let ip = ip
        .parse()
        .map_err(|_| ProtocolError::InvalidAddress(ip.to_string()))?;
    let port = match port.parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => return Err(ProtocolError::InvalidPort(port.to_string())),
    };
    Ok(SocketAddr::new(ip, port))
}

pub enum Negotiation {
    Accepted(BufReader<TcpStream>),
    Denied,
}

/// Outbound half of the negotiation: ask, then wait for a single reply. A
/// hang-up before the reply counts as a denial.
pub async fn request_connection(
    mut stream: BufReader<TcpStream>,
    local_username: &str,
) -> Result<Negotiation> {
    let request = PeerMessage::ConnectRequest {
        username: local_username.to_string(),
    };
    write_line(&mut stream, &request.to_line()).await?;

    let reply = match read_line(&mut stream, MAX_LINE_LEN).await? {
        Some(reply) => reply,
        None => return Ok(Negotiation::Denied),
    };
    match PeerMessage::parse(&reply) {
        Ok(PeerMessage::Accept) => Ok(Negotiation::Accepted(stream)),
        Ok(PeerMessage::Deny) => Ok(Negotiation::Denied),
        _ => Err(ProtocolError::UnexpectedReply(reply).into()),
    }
}

/// Reads the one line an inbound dialer sends and returns its username.
pub async fn read_connect_request(stream: &mut BufReader<TcpStream>) -> Result<String> {
    let line = read_line(stream, MAX_LINE_LEN)
        .await?
        .ok_or(Error::PeerClosed)?;
    match PeerMessage::parse(&line)? {
        PeerMessage::ConnectRequest { username } => Ok(username),
        other => Err(ProtocolError::UnexpectedReply(other.to_string()).into()),
    }
}

pub async fn answer(stream: &mut BufReader<TcpStream>, accept: bool) -> Result<()> {
    let reply = if accept {
        PeerMessage::Accept
    } else {
        PeerMessage::Deny
    };
    write_line(stream, &reply.to_line()).await
}

/// A `CONNECT_REQUEST` waiting for the local user's decision.
pub struct InboundRequest {
    pub username: String,
    pub addr: SocketAddr,
    pub stream: BufReader<TcpStream>,
}

impl InboundRequest {
    pub async fn deny(mut self) {
        if let Err(e) = answer(&mut self.stream, false).await {
            debug!("Could not deny {}: {}", self.username, e);
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Accepts direct connections on the client's listen port. Requests that
/// arrive while `state` is busy are denied here; the rest are handed to the
/// main loop through `requests`.
pub async fn run_inbound_listener(
    listener: TcpListener,
    state: watch::Receiver<ClientState>,
    requests: mpsc::Sender<InboundRequest>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept peer connection: {}", e);
                continue;
            }
        };
        debug!("Inbound connection from {}", addr);
        let state = state.clone();
        let requests = requests.clone();
        tokio::spawn(async move {
            let mut stream = BufReader::new(stream);
            let username = match read_connect_request(&mut stream).await {
                Ok(username) => username,
                Err(e) => {
                    debug!("Dropping inbound connection from {}: {}", addr, e);
                    return;
                }
            };
            let request = InboundRequest {
                username,
                addr,
                stream,
            };
            if state.borrow().is_busy() {
                info!("Auto-denying {} while busy", request.username);
                request.deny().await;
                return;
            }
            if let Err(mpsc::error::SendError(request)) = requests.send(request).await {
                request.deny().await;
            }
        });
    }
}
