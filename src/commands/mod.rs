//! # Commands Module
//!
//! The two process entry points of pqlink:
//!
//! ## `server`
//! Runs the rendezvous server:
//! - Keeps the registry of discoverable peers
//! - Answers `REGISTER`, `GET_PEER_LIST`, `REMOVE` and `PEER_DISCONNECTED`
//! - Announces newcomers to every open connection
//! - Reads operator commands (`showpeer`) from stdin
//!
//! ## `client`
//! Runs an interactive peer:
//! - Registers a username and listen port, or dials anonymously
//! - Negotiates `CONNECT_REQUEST` / `ACCEPT` / `DENY` directly with a peer
//! - Runs the ML-KEM key exchange and the encrypted chat loops
//! - Re-registers once a session ends

pub mod client;
pub mod server;
