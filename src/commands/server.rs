use std::error::Error;
use std::sync::Arc;

use log::{debug, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::console::spawn_stdin_reader;
use crate::registry::PeerRegistry;
use crate::rendezvous::{serve, RendezvousState};

/// Run the rendezvous server that lets peers find each other.
///
/// # Overview
/// The server only brokers discovery. It:
/// 1. Accepts a `REGISTER <username> <port>` from each client and records the
///    client's address next to the advertised listen port
/// 2. Replies with the current peer list and announces the newcomer to every
///    other open connection
/// 3. Serves `GET_PEER_LIST`, `REMOVE` and `PEER_DISCONNECTED` until the
///    client leaves, dropping its entry when the socket closes
///
/// Chat traffic never passes through here; peers dial each other directly.
///
/// # Architecture
/// - Main task: accept loop, one spawned handler per client
/// - Console task: operator commands on stdin (`showpeer`)
///
/// # Arguments
/// * `port` - The port number to bind to (5453 unless overridden)
pub async fn run(port: u16) -> Result<(), Box<dyn Error>> {
    let bind_addr = format!("0.0.0.0:{}", port);
    debug!("Attempting to bind to {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr).await?;
    println!("Rendezvous server listening on {}", bind_addr);
    info!("Rendezvous server started on {}", bind_addr);

    let state = Arc::new(RendezvousState::new());

    debug!("Spawning operator console");
    tokio::spawn(operator_console(spawn_stdin_reader(), Arc::clone(&state)));

    serve(listener, state).await?;
    Ok(())
}

async fn operator_console(mut input: mpsc::Receiver<String>, state: Arc<RendezvousState>) {
    while let Some(line) = input.recv().await {
        match line.trim() {
            "" => {}
            "showpeer" => print!("{}", describe_peers(&state.registry).await),
            _ => println!("Unknown command."),
        }
    }
    debug!("Operator console closed");
}

/// The `showpeer` report.
pub async fn describe_peers(registry: &PeerRegistry) -> String {
    let mut report = String::from("Discoverable peers:\n");
    for peer in registry.snapshot(None).await {
        report.push_str(&peer.to_string());
        report.push('\n');
    }
    report
}
