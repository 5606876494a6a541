use std::error::Error;

use log::{debug, info, warn};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::chat::{run_chat, ChatEnd, ChatEvent, ChatSession};
use crate::console::{confirm, prompt, prompt_port, show_prompt, spawn_stdin_reader, spinner};
use crate::cryptography::{session_fingerprint, NonceMode, Role};
use crate::networking::{connect, initiate_handshake, respond_handshake};
use crate::protocol::{validate_username, PeerRecord};
use crate::routing::{
    answer, parse_direct_target, request_connection, resolve_target, run_inbound_listener,
    ClientState, InboundRequest, Negotiation, Registration, RendezvousConnection, RendezvousLink,
    ServerEvent, TargetError,
};
use crate::{ANONYMOUS_USERNAME, DEFAULT_SERVER_ADDR, MAX_MESSAGE_LEN, QUIT_TOKEN, USERNAME_MAX_LEN};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rendezvous server as `host:port`.
    pub server: String,
    pub username: Option<String>,
    pub listen_port: Option<u16>,
    /// Dial peers by address without registering.
    pub anonymous: bool,
    pub nonce_mode: NonceMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: DEFAULT_SERVER_ADDR.to_string(),
            username: None,
            listen_port: None,
            anonymous: false,
            nonce_mode: NonceMode::default(),
        }
    }
}

/// Run the interactive chat client.
///
/// In discoverable mode the client registers with the rendezvous server,
/// listens for `CONNECT_REQUEST`s on its own port and lets the user dial any
/// listed peer by name. In anonymous mode it only dials `<ip> <port>` targets.
pub async fn run(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    debug!("Starting client command");
    let mut input = spawn_stdin_reader();

    if config.anonymous {
        return run_anonymous(&config, &mut input).await;
    }

    let listen_port = match config.listen_port {
        Some(port) => port,
        None => prompt_port(&mut input, "Enter your listening port: ")
            .await
            .ok_or("stdin closed")?,
    };
    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    let listen_port = listener.local_addr()?.port();
    info!("Listening for peers on port {}", listen_port);

    let mut client = Client::register(config, listen_port, input).await?;

    let (requests_tx, requests) = mpsc::channel(8);
    let listener_task = tokio::spawn(run_inbound_listener(listener, client.state(), requests_tx));
    client.main_loop(requests).await;
    listener_task.abort();
    Ok(())
}

/// A discoverable client. It reads user input from a channel, so the whole
/// dial/accept lifecycle can run without a terminal.
pub struct Client {
    config: ClientConfig,
    listen_port: u16,
    username: String,
    link: Option<RendezvousLink>,
    peers: Vec<PeerRecord>,
    state: watch::Sender<ClientState>,
    input: mpsc::Receiver<String>,
}

impl Client {
    /// Connects to the rendezvous server and registers, prompting on `input`
    /// for a username when none is configured or the chosen one is taken.
    pub async fn register(
        config: ClientConfig,
        listen_port: u16,
        input: mpsc::Receiver<String>,
    ) -> Result<Self, Box<dyn Error>> {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let mut client = Client {
            config,
            listen_port,
            username: String::new(),
            link: None,
            peers: Vec::new(),
            state,
            input,
        };
        client.register_interactive().await?;
        Ok(client)
    }

    /// Feed for the inbound listener's busy check.
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The last peer list received from the server.
    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    /// Whether the client currently holds a registered rendezvous connection.
    pub fn is_discoverable(&self) -> bool {
        self.link.is_some()
    }

    /// Waits for one server event and applies it. Returns `false` once there
    /// is no rendezvous connection left to listen on.
    pub async fn process_server_event(&mut self) -> bool {
        if self.link.is_none() {
            return false;
        }
        let event = next_server_event(&mut self.link).await;
        let connected = event.is_some();
        self.handle_server_event(event).await;
        connected
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Client state {:?} -> {:?}", previous, state);
        }
    }

    async fn register_interactive(&mut self) -> Result<(), Box<dyn Error>> {
        let mut connection = RendezvousConnection::connect(&self.config.server).await?;
        self.set_state(ClientState::Connected);

        let mut candidate = self.config.username.clone();
        loop {
            let username = match candidate.take() {
                Some(name) => name,
                None => prompt(&mut self.input, "Enter your username: ")
                    .await
                    .ok_or("stdin closed before registration")?,
            };
            if validate_username(&username).is_err() {
                println!(
                    "Usernames are 1 to {} characters with no spaces.",
                    USERNAME_MAX_LEN
                );
                continue;
            }

            match connection.register(&username, self.listen_port).await? {
                Registration::Registered(link) => {
                    println!("Registered as {}.", username);
                    self.username = username;
                    self.link = Some(link);
                    self.set_state(ClientState::Registered);
                    return Ok(());
                }
                Registration::UsernameTaken(returned) => {
                    println!("Username taken, please choose another.");
                    connection = returned;
                }
                Registration::Rejected(reason) => {
                    return Err(format!("Rendezvous server rejected registration: {}", reason).into())
                }
            }
        }
    }

    pub async fn main_loop(&mut self, mut requests: mpsc::Receiver<InboundRequest>) {
        self.set_state(ClientState::Idle);
        print_help();

        loop {
            tokio::select! {
                line = self.input.recv() => {
                    let Some(line) = line else {
                        self.withdraw().await;
                        break;
                    };
                    if !self.handle_command(line.trim()).await {
                        break;
                    }
                }
                Some(request) = requests.recv() => {
                    self.handle_inbound(request, &mut requests).await;
                }
                event = next_server_event(&mut self.link) => {
                    self.handle_server_event(event).await;
                }
            }
        }
    }

    /// Returns `false` when the user asked to quit.
    async fn handle_command(&mut self, line: &str) -> bool {
        match line {
            "" => {}
            "exit" => {
                self.withdraw().await;
                println!("Goodbye.");
                return false;
            }
            "list" => self.refresh_peers().await,
            "help" => print_help(),
            target => self.dial(target).await,
        }
        true
    }

    async fn handle_server_event(&mut self, event: Option<ServerEvent>) {
        match event {
            None => {
                println!("Lost connection to the rendezvous server; you are no longer discoverable.");
                self.link = None;
            }
            Some(ServerEvent::PeerList(peers)) => {
                self.peers = peers;
                print_peers(&self.peers);
            }
            Some(ServerEvent::NewPeer(username)) => {
                println!("New peer connected: {}", username);
                if self.current_state() == ClientState::Idle {
                    self.refresh_peers().await;
                }
            }
            Some(other) => println!("Server: {}", other),
        }
    }

    async fn refresh_peers(&mut self) {
        let Some(link) = self.link.as_mut() else {
            print_peers(&self.peers);
            println!("(not registered; this list may be stale)");
            return;
        };
        if let Err(e) = link.request_peer_list().await {
            warn!("Peer list request failed: {}", e);
            println!("Lost connection to the rendezvous server; you are no longer discoverable.");
            self.link = None;
        }
    }

    /// Dials a listed peer. On acceptance the client leaves the discoverable
    /// list for the length of the session and registers again afterwards.
    pub async fn dial(&mut self, target: &str) {
        let addr = match resolve_target(&self.peers, &self.username, target) {
            Ok(addr) => addr,
            Err(TargetError::SelfDial) => {
                println!("You cannot connect to yourself.");
                return;
            }
            Err(TargetError::UnknownPeer(_)) => {
                println!("No peer named {} in the list. Type 'list' to refresh.", target);
                return;
            }
        };

        self.set_state(ClientState::Negotiating);
        let stream = match connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Dialing {} at {} failed: {}", target, addr, e);
                println!("Peer {} is unreachable.", target);
                self.report_unreachable(target).await;
                self.set_state(ClientState::Idle);
                return;
            }
        };

        if let Some(stream) = negotiate(stream, &self.username, target).await {
            self.withdraw().await;
            self.session(stream, target.to_string(), Role::Initiator).await;
            self.reregister().await;
        }
        self.set_state(ClientState::Idle);
    }

    /// Asks the user about `request` on the input channel. Anything else
    /// already queued in `requests` is denied.
    pub async fn handle_inbound(
        &mut self,
        request: InboundRequest,
        requests: &mut mpsc::Receiver<InboundRequest>,
    ) {
        self.set_state(ClientState::Negotiating);
        while let Ok(queued) = requests.try_recv() {
            info!("Denying queued request from {}", queued.username);
            queued.deny().await;
        }

        show_prompt(&format!(
            "Incoming connection request from {} ({}). Accept? (y/n): ",
            request.username,
            request.addr.ip()
        ));
        if !confirm(&mut self.input).await {
            println!("Denied connection from {}.", request.username);
            request.deny().await;
            self.set_state(ClientState::Idle);
            return;
        }

        let InboundRequest {
            username,
            mut stream,
            ..
        } = request;
        if let Err(e) = answer(&mut stream, true).await {
            println!("Lost connection to {}: {}", username, e);
            self.set_state(ClientState::Idle);
            return;
        }
        self.withdraw().await;
        self.session(stream, username, Role::Responder).await;
        self.reregister().await;
        self.set_state(ClientState::Idle);
    }

    async fn session(&mut self, stream: BufReader<TcpStream>, remote: String, role: Role) {
        self.set_state(ClientState::InSession);
        run_session(
            stream,
            &self.username,
            remote,
            role,
            self.config.nonce_mode,
            &mut self.input,
        )
        .await;
    }

    async fn report_unreachable(&mut self, target: &str) {
        self.peers.retain(|peer| peer.username != target);
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.report_unreachable(target).await {
            warn!("Could not report {} as unreachable: {}", target, e);
            return;
        }
        if let Err(e) = link.request_peer_list().await {
            warn!("Peer list request failed: {}", e);
        }
    }

    /// Leaves the discoverable list, closing the rendezvous connection.
    async fn withdraw(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.withdraw().await {
                warn!("Could not leave the discoverable list: {}", e);
            }
        }
    }

    async fn reregister(&mut self) {
        self.set_state(ClientState::Disconnected);
        let outcome = match RendezvousConnection::connect(&self.config.server).await {
            Ok(connection) => {
                self.set_state(ClientState::Connected);
                connection.register(&self.username, self.listen_port).await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(Registration::Registered(link)) => {
                println!("You are discoverable again as {}.", self.username);
                self.link = Some(link);
                self.set_state(ClientState::Registered);
            }
            Ok(Registration::UsernameTaken(_)) => println!(
                "Username {} was taken while you were chatting; you are no longer discoverable.",
                self.username
            ),
            Ok(Registration::Rejected(reason)) => {
                println!("Rendezvous server refused re-registration: {}", reason)
            }
            Err(e) => {
                warn!("Re-registration failed: {}", e);
                println!("Could not reach the rendezvous server; you are no longer discoverable.");
            }
        }
    }
}

async fn next_server_event(link: &mut Option<RendezvousLink>) -> Option<ServerEvent> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

/// Dials by address only; nothing is registered and nobody can dial back.
async fn run_anonymous(
    config: &ClientConfig,
    input: &mut mpsc::Receiver<String>,
) -> Result<(), Box<dyn Error>> {
    println!("Anonymous mode: you are not listed and will not receive requests.");
    loop {
        let Some(line) = prompt(input, "Enter '<ip> <port>' to connect, or 'exit': ").await else {
            break;
        };
        match line.as_str() {
            "" => continue,
            "exit" => break,
            _ => {}
        }

        let addr = match parse_direct_target(&line) {
            Ok(addr) => addr,
            Err(e) => {
                println!("Invalid target: {}", e);
                continue;
            }
        };
        let stream = match connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                println!("Could not connect to {}: {}", addr, e);
                continue;
            }
        };
        let label = addr.to_string();
        if let Some(stream) = negotiate(stream, ANONYMOUS_USERNAME, &label).await {
            run_session(
                stream,
                ANONYMOUS_USERNAME,
                label,
                Role::Initiator,
                config.nonce_mode,
                input,
            )
            .await;
        }
    }
    println!("Goodbye.");
    Ok(())
}

/// Sends `CONNECT_REQUEST` and waits for the answer. `Some` means accepted.
async fn negotiate(stream: TcpStream, local: &str, target: &str) -> Option<BufReader<TcpStream>> {
    let progress = spinner(format!("Waiting for {} to respond...", target));
    let outcome = request_connection(BufReader::new(stream), local).await;
    progress.finish_and_clear();

    match outcome {
        Ok(Negotiation::Accepted(stream)) => {
            println!("{} accepted your request.", target);
            Some(stream)
        }
        Ok(Negotiation::Denied) => {
            println!("Connection request denied.");
            None
        }
        Err(e) => {
            println!("Connection request to {} failed: {}", target, e);
            None
        }
    }
}

async fn run_session(
    mut stream: BufReader<TcpStream>,
    local: &str,
    remote: String,
    role: Role,
    nonce_mode: NonceMode,
    input: &mut mpsc::Receiver<String>,
) {
    let progress = spinner(format!("Exchanging keys with {}...", remote));
    let handshake = match role {
        Role::Initiator => initiate_handshake(&mut stream).await,
        Role::Responder => respond_handshake(&mut stream).await,
    };
    progress.finish_and_clear();

    let context = match handshake {
        Ok(context) => context,
        Err(e) => {
            warn!("Key exchange with {} failed: {}", remote, e);
            println!("Key exchange with {} failed.", remote);
            return;
        }
    };

    println!("Secure session established with {}.", remote);
    println!(
        "Session fingerprint: {} (compare it with {} out of band)",
        session_fingerprint(&context),
        remote
    );
    if nonce_mode == NonceMode::Static {
        println!("Warning: static nonce mode reuses one nonce for every message.");
    }
    println!("Type a message and press Enter. Type {} to leave the chat.", QUIT_TOKEN);

    let (events_tx, events) = mpsc::unbounded_channel();
    let display = tokio::spawn(display_chat(events));
    let session = ChatSession {
        local_username: local.to_string(),
        remote_username: remote.clone(),
        role,
        context,
        nonce_mode,
    };
    let end = run_chat(stream, session, input, events_tx).await;
    let _ = display.await;

    match end {
        ChatEnd::LocalQuit => println!("You left the chat with {}.", remote),
        ChatEnd::EncryptionFailed => println!("Encryption failed; the session was closed."),
        other => debug!("Session with {} ended: {:?}", remote, other),
    }
}

async fn display_chat(mut events: mpsc::UnboundedReceiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Message { from, text } => println!("{}: {}", from, text),
            ChatEvent::Closed { peer } => println!("Connection closed by {}.", peer),
            ChatEvent::DecryptionFailed { peer } => {
                println!("Decryption failed; closing the session with {}.", peer)
            }
            ChatEvent::MessageTooLong { len } => println!(
                "Message too long ({} bytes, limit {}); not sent.",
                len, MAX_MESSAGE_LEN
            ),
        }
    }
}

fn print_peers(peers: &[PeerRecord]) {
    if peers.is_empty() {
        println!("No other peers are online.");
        return;
    }
    println!("Available peers:");
    for peer in peers {
        println!("  {} ({}:{})", peer.username, peer.address, peer.listen_port);
    }
}

fn print_help() {
    println!("Type a username to chat, 'list' to refresh peers, 'exit' to quit.");
}
