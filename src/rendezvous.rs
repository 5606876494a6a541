use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::Mutex;

use crate::error::RegistryError;
use crate::networking::read_line;
use crate::protocol::{
    format_peer_list, new_peer_notice, PeerRecord, ServerCommand, INVALID_COMMAND, SERVER_FULL,
    USERNAME_TAKEN,
};
use crate::registry::{OwnerId, PeerRegistry};
use crate::MAX_LINE_LEN;

pub type ConnectionId = OwnerId;

/// Lines queued for one client before it counts as not reading.
pub const OUTBOX_CAPACITY: usize = 64;

/// Shared state of the rendezvous server: the peer registry and the set of
/// open client sockets used for broadcast fan-out. Each is locked on its own
/// and never while the other is held.
pub struct RendezvousState {
    pub registry: PeerRegistry,
    clients: Mutex<HashMap<ConnectionId, Sender<String>>>,
    next_id: AtomicU64,
}

impl Default for RendezvousState {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousState {
    pub fn new() -> Self {
        Self::with_registry(PeerRegistry::new())
    }

    pub fn with_registry(registry: PeerRegistry) -> Self {
        RendezvousState {
            registry,
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn add_client(&self, outbox: Sender<String>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().await.insert(id, outbox);
        id
    }

    async fn remove_client(&self, id: ConnectionId) {
        self.clients.lock().await.remove(&id);
    }

    /// Number of open sockets in the broadcast set, registered or not.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Queues `message` for every open socket except `exclude`. The set is
    /// copied out under the lock; the sends happen after it is released.
    /// A client whose outbox is full misses the message.
    pub async fn broadcast(&self, message: &str, exclude: ConnectionId) {
        let recipients: Vec<(ConnectionId, Sender<String>)> = {
            let clients = self.clients.lock().await;
            clients
                .iter()
                .filter(|(id, _)| **id != exclude)
                .map(|(id, outbox)| (*id, outbox.clone()))
                .collect()
        };
        debug!("Broadcasting to {} clients: {:?}", recipients.len(), message.trim_end());
        for (id, outbox) in recipients {
            if let Err(TrySendError::Full(_)) = outbox.try_send(message.to_string()) {
                warn!("Outbox of connection {} is full, dropping broadcast", id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registering,
    Registered { username: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Accept loop: one task per client, each owning its socket.
pub async fn serve(listener: TcpListener, state: Arc<RendezvousState>) -> io::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        info!("New client connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, Arc::clone(&state)));
    }
}

/// Drives one client through `Connecting → Registering → Registered → Closed`.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<RendezvousState>) {
    let (read_half, write_half) = stream.into_split();
    let (outbox, inbox) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let writer = tokio::spawn(write_task(write_half, inbox, addr));

    let mut connection = ClientConnection {
        id: 0,
        addr,
        state: ConnectionState::Connecting,
        outbox,
        rendezvous: state,
    };
    connection.id = connection.rendezvous.add_client(connection.outbox.clone()).await;
    connection.state = ConnectionState::Registering;

    let mut reader = BufReader::new(read_half);
    loop {
        match read_line(&mut reader, MAX_LINE_LEN).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if connection.handle_line(&line).await == Flow::Close {
                    break;
                }
            }
            Ok(None) => {
                info!("[{}] {} disconnected", addr, connection.label());
                break;
            }
            Err(e) => {
                warn!("[{}] {} dropped: {}", addr, connection.label(), e);
                break;
            }
        }
    }

    connection.close().await;
    drop(connection);
    let _ = writer.await;
}

struct ClientConnection {
    id: ConnectionId,
    addr: SocketAddr,
    state: ConnectionState,
    outbox: Sender<String>,
    rendezvous: Arc<RendezvousState>,
}

impl ClientConnection {
    fn label(&self) -> &str {
        match &self.state {
            ConnectionState::Registered { username } => username,
            _ => "<unregistered>",
        }
    }

    /// Queues a reply. A client that has stopped reading is disconnected.
    fn reply(&self, message: impl Into<String>) -> Flow {
        let mut message = message.into();
        if !message.ends_with('\n') {
            message.push('\n');
        }
        match self.outbox.try_send(message) {
            Ok(()) => Flow::Continue,
            Err(TrySendError::Full(_)) => {
                warn!("[{}] {} is not reading replies, closing", self.addr, self.label());
                Flow::Close
            }
            Err(TrySendError::Closed(_)) => Flow::Close,
        }
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let command = match ServerCommand::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!("[{}] rejected {:?}: {}", self.addr, line, e);
                return self.reply(INVALID_COMMAND);
            }
        };

        let registered = match &self.state {
            ConnectionState::Registered { username } => Some(username.clone()),
            _ => None,
        };
        match (registered, command) {
            (None, ServerCommand::Register { username, port }) => {
                self.register(username, port).await
            }
            (Some(own), ServerCommand::GetPeerList) => {
                let peers = self.rendezvous.registry.snapshot(Some(&own)).await;
                self.reply(format_peer_list(&peers))
            }
            (Some(own), ServerCommand::Remove { username }) => {
                if own != username {
                    warn!("[{}] {} asked to remove {}", self.addr, own, username);
                }
                self.rendezvous.registry.remove(&username).await;
                info!("[{}] {} left the discoverable list", self.addr, username);
                Flow::Close
            }
            (Some(reporter), ServerCommand::PeerDisconnected { username }) => {
                if self.rendezvous.registry.remove(&username).await {
                    info!("Peer {} reported unreachable by {}", username, reporter);
                }
                Flow::Continue
            }
            (_, command) => {
                debug!("[{}] {} not accepted in state {:?}", self.addr, command, self.state);
                self.reply(INVALID_COMMAND)
            }
        }
    }

    async fn register(&mut self, username: String, port: u16) -> Flow {
        let record = PeerRecord::new(username.clone(), self.addr.ip(), port);
        match self.rendezvous.registry.register_owned(record, self.id).await {
            Ok(others) => {
                info!("[{}] {} registered on port {}", self.addr, username, port);
                self.state = ConnectionState::Registered {
                    username: username.clone(),
                };
                let flow = self.reply(format_peer_list(&others));
                self.rendezvous
                    .broadcast(&new_peer_notice(&username), self.id)
                    .await;
                flow
            }
            Err(RegistryError::UsernameTaken(name)) => {
                info!("[{}] attempted to register taken username {}", self.addr, name);
                self.reply(USERNAME_TAKEN)
            }
            Err(RegistryError::Full { capacity }) => {
                warn!("[{}] registry full ({} peers), rejecting {}", self.addr, capacity, username);
                self.reply(SERVER_FULL)
            }
        }
    }

    /// Drops this connection's own registry entry, if it still has one.
    async fn close(&mut self) {
        if let ConnectionState::Registered { username } = &self.state {
            self.rendezvous.registry.remove_owned(username, self.id).await;
        }
        self.rendezvous.remove_client(self.id).await;
        debug!("[{}] {} connection closed", self.addr, self.label());
        self.state = ConnectionState::Closed;
    }
}

async fn write_task(
    mut writer: OwnedWriteHalf,
    mut inbox: Receiver<String>,
    addr: SocketAddr,
) {
    while let Some(message) = inbox.recv().await {
        if let Err(e) = writer.write_all(message.as_bytes()).await {
            debug!("[{}] write failed: {}", addr, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PEER_LIST;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::tcp::OwnedReadHalf;

    async fn start_server(state: Arc<RendezvousState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state));
        addr
    }

    async fn next_line(reader: &mut BufReader<OwnedReadHalf>) -> Option<String> {
        let mut line = String::new();
        match reader.read_line(&mut line).await.unwrap() {
            0 => None,
            _ => Some(line.trim_end().to_string()),
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let state = RendezvousState::new();
        let (alice_tx, mut alice_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (bob_tx, mut bob_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let alice = state.add_client(alice_tx).await;
        state.add_client(bob_tx).await;

        state.broadcast(&new_peer_notice("alice"), alice).await;
        assert_eq!(bob_rx.recv().await.as_deref(), Some("New peer connected: alice\n"));
        assert!(alice_rx.try_recv().is_err());

        state.remove_client(alice).await;
        assert_eq!(state.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_drops_for_full_outbox() {
        let state = RendezvousState::new();
        let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
        let (reader_tx, mut reader_rx) = mpsc::channel(OUTBOX_CAPACITY);
        state.add_client(stalled_tx).await;
        state.add_client(reader_tx).await;

        state.broadcast(&new_peer_notice("alice"), 0).await;
        state.broadcast(&new_peer_notice("bob"), 0).await;

        assert_eq!(stalled_rx.recv().await.as_deref(), Some("New peer connected: alice\n"));
        assert!(stalled_rx.try_recv().is_err());
        assert_eq!(reader_rx.recv().await.as_deref(), Some("New peer connected: alice\n"));
        assert_eq!(reader_rx.recv().await.as_deref(), Some("New peer connected: bob\n"));
    }

    #[tokio::test]
    async fn test_stale_connection_close_spares_reregistered_name() {
        let state = Arc::new(RendezvousState::new());
        let addr = start_server(Arc::clone(&state)).await;

        let (read, mut old_write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut old_reader = BufReader::new(read);
        old_write.write_all(b"REGISTER alice 6001\n").await.unwrap();
        assert_eq!(next_line(&mut old_reader).await.as_deref(), Some(PEER_LIST));

        let (read, mut bob_write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut bob_reader = BufReader::new(read);
        bob_write.write_all(b"REGISTER bob 6002\n").await.unwrap();
        assert_eq!(next_line(&mut bob_reader).await.as_deref(), Some(PEER_LIST));
        bob_write.write_all(b"PEER_DISCONNECTED alice\n").await.unwrap();
        for _ in 0..100 {
            if !state.registry.exists("alice").await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!state.registry.exists("alice").await);

        let (read, mut new_write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut new_reader = BufReader::new(read);
        new_write.write_all(b"REGISTER alice 7001\n").await.unwrap();
        assert_eq!(next_line(&mut new_reader).await.as_deref(), Some(PEER_LIST));

        drop(old_write);
        drop(old_reader);
        let clients = state.client_count().await;
        for _ in 0..100 {
            if state.client_count().await < clients {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state.client_count().await, clients - 1);

        let alice = state
            .registry
            .snapshot(None)
            .await
            .into_iter()
            .find(|peer| peer.username == "alice")
            .unwrap();
        assert_eq!(alice.listen_port, 7001);
    }

    #[tokio::test]
    async fn test_register_is_rejected_twice_on_one_connection() {
        let state = Arc::new(RendezvousState::new());
        let addr = start_server(Arc::clone(&state)).await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"REGISTER alice 6001\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await.as_deref(), Some(PEER_LIST));

        write.write_all(b"REGISTER alias 6002\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await.as_deref(), Some(INVALID_COMMAND));
        assert!(!state.registry.exists("alias").await);
    }

    #[tokio::test]
    async fn test_commands_before_registration_are_invalid() {
        let state = Arc::new(RendezvousState::new());
        let addr = start_server(Arc::clone(&state)).await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"GET_PEER_LIST\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await.as_deref(), Some(INVALID_COMMAND));
        write.write_all(b"REGISTER alice 6001\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await.as_deref(), Some(PEER_LIST));
    }

    #[tokio::test]
    async fn test_full_registry_replies_server_full() {
        let state = Arc::new(RendezvousState::with_registry(PeerRegistry::with_capacity(1)));
        let addr = start_server(Arc::clone(&state)).await;

        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut first = BufReader::new(read);
        write.write_all(b"REGISTER alice 6001\n").await.unwrap();
        assert_eq!(next_line(&mut first).await.as_deref(), Some(PEER_LIST));

        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut second = BufReader::new(read);
        write.write_all(b"REGISTER bob 6002\n").await.unwrap();
        assert_eq!(next_line(&mut second).await.as_deref(), Some(SERVER_FULL));
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_closes_connection() {
        let state = Arc::new(RendezvousState::new());
        let addr = start_server(Arc::clone(&state)).await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"REGISTER alice 6001\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await.as_deref(), Some(PEER_LIST));
        write.write_all(b"REMOVE alice\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, None);
        assert!(!state.registry.exists("alice").await);
    }
}
