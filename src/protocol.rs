//! Wire messages for both conversations a peer takes part in:
//! - newline-delimited commands to/from the rendezvous server
//! - the `CONNECT_REQUEST` / `ACCEPT` / `DENY` exchange on a direct socket
//!
//! Every type renders with `Display` to its wire form without the trailing
//! newline; [`ServerCommand::to_line`] and friends add it.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::USERNAME_MAX_LEN;

pub const PEER_LIST: &str = "PEER_LIST";
pub const USERNAME_TAKEN: &str = "USERNAME_TAKEN";
pub const INVALID_COMMAND: &str = "INVALID_COMMAND";
pub const SERVER_FULL: &str = "SERVER_FULL";
pub const NEW_PEER_PREFIX: &str = "New peer connected: ";

/// A registry entry binding a username to a reachable listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub username: String,
    pub address: IpAddr,
    pub listen_port: u16,
}

impl PeerRecord {
    pub fn new(username: impl Into<String>, address: IpAddr, listen_port: u16) -> Self {
        PeerRecord {
            username: username.into(),
            address,
            listen_port,
        }
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.username, self.address, self.listen_port)
    }
}

impl FromStr for PeerRecord {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let (Some(username), Some(address), Some(port), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::Malformed { command: "peer line" });
        };
        let username = validate_username(username)?;
        let address = address
            .parse::<IpAddr>()
            .map_err(|_| ProtocolError::InvalidAddress(address.to_string()))?;
        let listen_port = parse_port(port)?;
        Ok(PeerRecord {
            username,
            address,
            listen_port,
        })
    }
}

/// Usernames are one whitespace-free token of 1..=USERNAME_MAX_LEN bytes.
pub fn validate_username(candidate: &str) -> Result<String, ProtocolError> {
    if candidate.is_empty()
        || candidate.len() > USERNAME_MAX_LEN
        || candidate.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ProtocolError::InvalidUsername(candidate.to_string()));
    }
    Ok(candidate.to_string())
}

fn parse_port(raw: &str) -> Result<u16, ProtocolError> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProtocolError::InvalidPort(raw.to_string())),
    }
}

/// Renders a full `PEER_LIST` reply: the header line followed by one
/// newline-terminated line per peer.
pub fn format_peer_list(peers: &[PeerRecord]) -> String {
    let mut reply = format!("{}\n", PEER_LIST);
    for peer in peers {
        reply.push_str(&peer.to_string());
        reply.push('\n');
    }
    reply
}

/// Client to rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Register { username: String, port: u16 },
    GetPeerList,
    Remove { username: String },
    PeerDisconnected { username: String },
}

impl ServerCommand {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        let keyword = parts.next().ok_or(ProtocolError::Empty)?;
        let args: Vec<&str> = parts.collect();

        match (keyword, args.as_slice()) {
            ("REGISTER", [username, port]) => Ok(ServerCommand::Register {
                username: validate_username(username)?,
                port: parse_port(port)?,
            }),
            ("REGISTER", _) => Err(ProtocolError::Malformed { command: "REGISTER" }),
            ("GET_PEER_LIST", []) => Ok(ServerCommand::GetPeerList),
            ("GET_PEER_LIST", _) => Err(ProtocolError::Malformed {
                command: "GET_PEER_LIST",
            }),
            ("REMOVE", [username]) => Ok(ServerCommand::Remove {
                username: validate_username(username)?,
            }),
            ("REMOVE", _) => Err(ProtocolError::Malformed { command: "REMOVE" }),
            ("PEER_DISCONNECTED", [username]) => Ok(ServerCommand::PeerDisconnected {
                username: validate_username(username)?,
            }),
            ("PEER_DISCONNECTED", _) => Err(ProtocolError::Malformed {
                command: "PEER_DISCONNECTED",
            }),
            (other, _) => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerCommand::Register { username, port } => write!(f, "REGISTER {} {}", username, port),
            ServerCommand::GetPeerList => f.write_str("GET_PEER_LIST"),
            ServerCommand::Remove { username } => write!(f, "REMOVE {}", username),
            ServerCommand::PeerDisconnected { username } => {
                write!(f, "PEER_DISCONNECTED {}", username)
            }
        }
    }
}

/// One line received from the rendezvous server. A `PEER_LIST` reply spans
/// several lines: the header, then zero or more [`ServerLine::Peer`] lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    PeerListHeader,
    Peer(PeerRecord),
    UsernameTaken,
    InvalidCommand,
    ServerFull,
    NewPeer(String),
    Other(String),
}

impl ServerLine {
    pub fn parse(line: &str) -> ServerLine {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            PEER_LIST => ServerLine::PeerListHeader,
            USERNAME_TAKEN => ServerLine::UsernameTaken,
            INVALID_COMMAND => ServerLine::InvalidCommand,
            SERVER_FULL => ServerLine::ServerFull,
            _ => {
                if let Some(username) = line.strip_prefix(NEW_PEER_PREFIX) {
                    return ServerLine::NewPeer(username.trim().to_string());
                }
                match line.parse::<PeerRecord>() {
                    Ok(record) => ServerLine::Peer(record),
                    Err(_) => ServerLine::Other(line.to_string()),
                }
            }
        }
    }
}

pub fn new_peer_notice(username: &str) -> String {
    format!("{}{}\n", NEW_PEER_PREFIX, username)
}

/// Messages on a direct peer socket before the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    ConnectRequest { username: String },
    Accept,
    Deny,
}

impl PeerMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        let keyword = parts.next().ok_or(ProtocolError::Empty)?;
        let args: Vec<&str> = parts.collect();
        match (keyword, args.as_slice()) {
            ("CONNECT_REQUEST", [username]) => Ok(PeerMessage::ConnectRequest {
                username: validate_username(username)?,
            }),
            ("CONNECT_REQUEST", _) => Err(ProtocolError::Malformed {
                command: "CONNECT_REQUEST",
            }),
            ("ACCEPT", []) => Ok(PeerMessage::Accept),
            ("DENY", []) => Ok(PeerMessage::Deny),
            (other, _) => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::ConnectRequest { username } => write!(f, "CONNECT_REQUEST {}", username),
            PeerMessage::Accept => f.write_str("ACCEPT"),
            PeerMessage::Deny => f.write_str("DENY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn test_parse_register() {
        assert_eq!(
            ServerCommand::parse("REGISTER alice 6001\n").unwrap(),
            ServerCommand::Register {
                username: "alice".to_string(),
                port: 6001
            }
        );
    }

    #[test]
    fn test_register_rejects_bad_port_and_arity() {
        assert_eq!(
            ServerCommand::parse("REGISTER alice notaport"),
            Err(ProtocolError::InvalidPort("notaport".to_string()))
        );
        assert_eq!(
            ServerCommand::parse("REGISTER alice 70000"),
            Err(ProtocolError::InvalidPort("70000".to_string()))
        );
        assert_eq!(
            ServerCommand::parse("REGISTER alice"),
            Err(ProtocolError::Malformed { command: "REGISTER" })
        );
    }

    #[test]
    fn test_username_length_limit() {
        let longest = "a".repeat(USERNAME_MAX_LEN);
        assert!(validate_username(&longest).is_ok());
        let too_long = "a".repeat(USERNAME_MAX_LEN + 1);
        assert!(matches!(
            ServerCommand::parse(&format!("REGISTER {} 5000", too_long)),
            Err(ProtocolError::InvalidUsername(_))
        ));
    }

    #[test]
    fn test_unknown_and_empty_commands() {
        assert_eq!(
            ServerCommand::parse("HELLO there"),
            Err(ProtocolError::UnknownCommand("HELLO".to_string()))
        );
        assert_eq!(ServerCommand::parse("   "), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_command_wire_format() {
        let remove = ServerCommand::Remove {
            username: "bob".to_string(),
        };
        assert_eq!(remove.to_line(), "REMOVE bob\n");
        assert_eq!(ServerCommand::GetPeerList.to_line(), "GET_PEER_LIST\n");
        assert_eq!(
            ServerCommand::parse(&remove.to_line()).unwrap(),
            remove
        );
    }

    #[test]
    fn test_format_peer_list() {
        assert_eq!(format_peer_list(&[]), "PEER_LIST\n");
        let peers = vec![
            PeerRecord::new("alice", localhost(), 6001),
            PeerRecord::new("carol", localhost(), 6003),
        ];
        assert_eq!(
            format_peer_list(&peers),
            "PEER_LIST\nalice 127.0.0.1 6001\ncarol 127.0.0.1 6003\n"
        );
    }

    #[test]
    fn test_server_line_classification() {
        assert_eq!(ServerLine::parse("PEER_LIST\n"), ServerLine::PeerListHeader);
        assert_eq!(ServerLine::parse("USERNAME_TAKEN"), ServerLine::UsernameTaken);
        assert_eq!(
            ServerLine::parse("New peer connected: bob\n"),
            ServerLine::NewPeer("bob".to_string())
        );
        assert_eq!(
            ServerLine::parse("alice 10.0.0.2 6001"),
            ServerLine::Peer(PeerRecord::new("alice", "10.0.0.2".parse().unwrap(), 6001))
        );
        assert_eq!(
            ServerLine::parse("something else"),
            ServerLine::Other("something else".to_string())
        );
    }

    #[test]
    fn test_peer_record_ipv6() {
        let record: PeerRecord = "dave ::1 7000".parse().unwrap();
        assert_eq!(record.address, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(record.to_string(), "dave ::1 7000");
    }

    #[test]
    fn test_peer_messages() {
        assert_eq!(
            PeerMessage::parse("CONNECT_REQUEST bob\n").unwrap(),
            PeerMessage::ConnectRequest {
                username: "bob".to_string()
            }
        );
        assert_eq!(PeerMessage::parse("ACCEPT").unwrap(), PeerMessage::Accept);
        assert_eq!(PeerMessage::parse("DENY\r\n").unwrap(), PeerMessage::Deny);
        assert!(PeerMessage::parse("MAYBE").is_err());
        assert_eq!(PeerMessage::Deny.to_line(), "DENY\n");
    }
}
