use std::io;
use thiserror::Error;

/// Malformed or unexpected protocol input. Non-fatal on the rendezvous
/// server (answered with `INVALID_COMMAND`), fatal for a direct peer exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed {command} command")]
    Malformed { command: &'static str },
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("frame of {len} bytes exceeds {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("username {0:?} is already registered")]
    UsernameTaken(String),
    #[error("registry is full ({capacity} peers)")]
    Full { capacity: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(&'static str),
    #[error("encapsulation failed: {0}")]
    Encapsulation(&'static str),
    #[error("decapsulation failed: {0}")]
    Decapsulation(&'static str),
    #[error("{what} has length {actual}, expected {expected}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("shared secret shorter than {0} bytes")]
    ShortSecret(usize),
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed")]
    Open,
    #[error("nonce sequence exhausted")]
    NonceExhausted,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("connection closed by peer")]
    PeerClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
