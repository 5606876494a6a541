pub mod chat;
pub mod commands;
pub mod console;
pub mod cryptography;
pub mod error;
pub mod networking;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod routing;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

pub const DEFAULT_SERVER_PORT: u16 = 5453;
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5453";

pub const USERNAME_MAX_LEN: usize = 49;
pub const MAX_PEERS: usize = 100;
pub const MAX_LINE_LEN: usize = 1024;
pub const MAX_MESSAGE_LEN: usize = 1024;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub const QUIT_TOKEN: &str = "/quit";
pub const ANONYMOUS_USERNAME: &str = "Anonymous";
