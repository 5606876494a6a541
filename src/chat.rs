use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::cryptography::{decrypt, encrypt, EncryptionContext, NonceMode, NonceSequence, Role};
use crate::networking::{read_frame, write_frame};
use crate::{MAX_FRAME_LEN, MAX_MESSAGE_LEN, QUIT_TOKEN};

/// Everything one end needs to run an established session.
pub struct ChatSession {
    pub local_username: String,
    pub remote_username: String,
    pub role: Role,
    pub context: EncryptionContext,
    pub nonce_mode: NonceMode,
}

/// What the chat loops want shown to the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message { from: String, text: String },
    Closed { peer: String },
    DecryptionFailed { peer: String },
    MessageTooLong { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEnd {
    /// The local user typed the quit token or closed stdin.
    LocalQuit,
    PeerClosed,
    DecryptionFailed,
    EncryptionFailed,
    TransportFailed,
}

/// Runs the send and receive loops over `stream` until either ends, then
/// tears down the other so neither can outlive the session.
///
/// Lines are taken from `input`; the receiver stays usable afterwards.
pub async fn run_chat<S>(
    stream: S,
    session: ChatSession,
    input: &mut mpsc::Receiver<String>,
    events: mpsc::UnboundedSender<ChatEvent>,
) -> ChatEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let ChatSession {
        local_username,
        remote_username,
        role,
        context,
        nonce_mode,
    } = session;
    let context = Arc::new(context);
    let outbound = NonceSequence::outbound(&context, role, nonce_mode);
    let inbound = NonceSequence::inbound(&context, role, nonce_mode);
    debug!(
        "{} chatting with {} as {:?} ({:?} nonces)",
        local_username, remote_username, role, nonce_mode
    );

    let (reader, mut writer) = io::split(stream);
    let mut receiver = tokio::spawn(receive_loop(
        reader,
        Arc::clone(&context),
        inbound,
        remote_username,
        events.clone(),
    ));

    let end = tokio::select! {
        end = send_loop(&mut writer, &context, outbound, input, &events) => {
            receiver.abort();
            end
        }
        joined = &mut receiver => match joined {
            Ok(end) => end,
            Err(e) => {
                warn!("Receive loop failed: {}", e);
                ChatEnd::TransportFailed
            }
        },
    };

    let _ = writer.shutdown().await;
    end
}

async fn send_loop<W>(
    writer: &mut W,
    context: &EncryptionContext,
    mut nonces: NonceSequence,
    input: &mut mpsc::Receiver<String>,
    events: &mpsc::UnboundedSender<ChatEvent>,
) -> ChatEnd
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = input.recv().await {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == QUIT_TOKEN {
            return ChatEnd::LocalQuit;
        }
        if line.is_empty() {
            continue;
        }
        if line.len() > MAX_MESSAGE_LEN {
            let _ = events.send(ChatEvent::MessageTooLong { len: line.len() });
            continue;
        }

        let sealed = match encrypt(context, &mut nonces, line.as_bytes()) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Could not encrypt message: {}", e);
                return ChatEnd::EncryptionFailed;
            }
        };
        if let Err(e) = write_frame(writer, &sealed).await {
            debug!("Send loop stopping: {}", e);
            return ChatEnd::TransportFailed;
        }
    }
    ChatEnd::LocalQuit
}

async fn receive_loop<R>(
    mut reader: R,
    context: Arc<EncryptionContext>,
    mut nonces: NonceSequence,
    peer: String,
    events: mpsc::UnboundedSender<ChatEvent>,
) -> ChatEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader, MAX_FRAME_LEN).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = events.send(ChatEvent::Closed { peer });
                return ChatEnd::PeerClosed;
            }
            Err(e) => {
                debug!("Receive loop stopping: {}", e);
                let _ = events.send(ChatEvent::Closed { peer });
                return ChatEnd::TransportFailed;
            }
        };

        match decrypt(&context, &mut nonces, &frame) {
            Ok(plaintext) => {
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                let _ = events.send(ChatEvent::Message {
                    from: peer.clone(),
                    text,
                });
            }
            Err(e) => {
                debug!("Dropping session with {}: {}", peer, e);
                let _ = events.send(ChatEvent::DecryptionFailed { peer });
                return ChatEnd::DecryptionFailed;
            }
        }
    }
}
