use std::io::{self, ErrorKind};

use log::debug;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::cryptography::{encapsulate, generate_iv, generate_keypair, EncryptionContext};
use crate::error::{Error, ProtocolError, Result};
use crate::NONCE_SIZE;

/// Upper bound for a handshake frame; comfortably above every ML-KEM blob.
const MAX_HANDSHAKE_FRAME: usize = 4096;

pub async fn connect<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<TcpStream> {
    debug!("Connecting to {:?}", addr);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Reads one newline-terminated line of at most `limit` bytes (excluding the
/// terminator). Returns `None` on a clean end of stream. A final line without
/// a terminator is still returned.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    // Room for the longest terminator, `\r\n`.
    let bound = (limit + 2) as u64;
    let n = (&mut *reader).take(bound).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > limit {
        return Err(ProtocolError::LineTooLong { limit }.into());
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Writes `len (u32, big-endian) ‖ payload`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame. `None` means the stream ended cleanly
/// before a new frame started; ending inside a frame is a transport error.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside a frame length prefix",
                )
                .into())
            }
            n => filled += n,
        }
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > limit {
        return Err(ProtocolError::FrameTooLarge { len, limit }.into());
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Initiator side of the key exchange: publish a fresh encapsulation key,
/// decapsulate the responder's ciphertext, then take the responder's IV.
pub async fn initiate_handshake<S>(stream: &mut S) -> Result<EncryptionContext>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (public_key, secret_key) = generate_keypair()?;
    debug!("Sending {} byte encapsulation key", public_key.len());
    write_frame(stream, &public_key).await?;

    let ciphertext = read_frame(stream, MAX_HANDSHAKE_FRAME)
        .await?
        .ok_or(Error::PeerClosed)?;
    debug!("Received {} byte KEM ciphertext", ciphertext.len());
    let shared_secret = secret_key.decapsulate(&ciphertext)?;

    let mut iv = [0u8; NONCE_SIZE];
    stream.read_exact(&mut iv).await?;

    Ok(EncryptionContext::from_shared_secret(&shared_secret, iv)?)
}

/// Responder side: encapsulate against the initiator's key and return the
/// ciphertext followed by a fresh random IV.
pub async fn respond_handshake<S>(stream: &mut S) -> Result<EncryptionContext>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public_key = read_frame(stream, MAX_HANDSHAKE_FRAME)
        .await?
        .ok_or(Error::PeerClosed)?;
    debug!("Received {} byte encapsulation key", public_key.len());
    let (ciphertext, shared_secret) = encapsulate(&public_key)?;
    let iv = generate_iv();

    write_frame(stream, &ciphertext).await?;
    stream.write_all(&iv).await?;
    stream.flush().await?;
    debug!("Sent {} byte KEM ciphertext and IV", ciphertext.len());

    Ok(EncryptionContext::from_shared_secret(&shared_secret, iv)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::{decrypt, encrypt, session_fingerprint, NonceMode, NonceSequence, Role};
    use crate::error::CryptoError;
    use tokio::io::{duplex, BufReader};

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let mut reader = BufReader::new(&b"REGISTER alice 6001\r\nGET_PEER_LIST\nlast"[..]);
        assert_eq!(
            read_line(&mut reader, 64).await.unwrap().as_deref(),
            Some("REGISTER alice 6001")
        );
        assert_eq!(
            read_line(&mut reader, 64).await.unwrap().as_deref(),
            Some("GET_PEER_LIST")
        );
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("last"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_rejects_oversized_line() {
        let long = format!("{}\n", "x".repeat(100));
        let mut reader = BufReader::new(long.as_bytes());
        let err = read_line(&mut reader, 10).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::LineTooLong { limit: 10 })
        ));
    }

    #[tokio::test]
    async fn test_line_at_exact_limit_is_accepted() {
        let mut reader = BufReader::new(&b"0123456789\n"[..]);
        assert_eq!(
            read_line(&mut reader, 10).await.unwrap().as_deref(),
            Some("0123456789")
        );
    }

    #[tokio::test]
    async fn test_crlf_line_at_exact_limit_is_accepted() {
        let mut reader = BufReader::new(&b"0123456789\r\n01234567890\r\n"[..]);
        assert_eq!(
            read_line(&mut reader, 10).await.unwrap().as_deref(),
            Some("0123456789")
        );
        let err = read_line(&mut reader, 10).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::LineTooLong { limit: 10 })
        ));
    }

    #[tokio::test]
    async fn test_frame_round_trip_and_clean_eof() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, b"payload").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b, 64).await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(read_frame(&mut b, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_over_limit_rejected() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, &[0u8; 100]).await.unwrap();
        let err = read_frame(&mut b, 50).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameTooLarge { len: 100, limit: 50 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let (mut a, mut b) = duplex(1024);
        a.write_u32(10).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, 64).await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_partial_length_prefix_is_transport_error() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(&[0u8, 0]).await.unwrap();
        drop(a);
        match read_frame(&mut b, 64).await {
            Err(Error::Transport(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_agreement() {
        let (mut initiator_io, mut responder_io) = duplex(16 * 1024);
        let (initiator, responder) = tokio::join!(
            initiate_handshake(&mut initiator_io),
            respond_handshake(&mut responder_io)
        );
        let initiator = initiator.unwrap();
        let responder = responder.unwrap();

        assert_eq!(initiator.iv(), responder.iv());
        assert_eq!(session_fingerprint(&initiator), session_fingerprint(&responder));

        let mut send = NonceSequence::outbound(&responder, Role::Responder, NonceMode::Counter);
        let mut recv = NonceSequence::inbound(&initiator, Role::Initiator, NonceMode::Counter);
        let sealed = encrypt(&responder, &mut send, b"hi alice").unwrap();
        assert_eq!(decrypt(&initiator, &mut recv, &sealed).unwrap(), b"hi alice");
    }

    #[tokio::test]
    async fn test_responder_rejects_bogus_public_key() {
        let (mut initiator_io, mut responder_io) = duplex(16 * 1024);
        write_frame(&mut initiator_io, &[0u8; 12]).await.unwrap();
        let err = respond_handshake(&mut responder_io).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Crypto(CryptoError::InvalidLength { actual: 12, .. })
        ));
    }

    #[tokio::test]
    async fn test_initiator_sees_peer_hangup() {
        let (mut initiator_io, responder_io) = duplex(16 * 1024);
        let responder = tokio::spawn(async move {
            let mut responder_io = responder_io;
            let _ = read_frame(&mut responder_io, MAX_HANDSHAKE_FRAME).await;
            drop(responder_io);
        });
        let err = initiate_handshake(&mut initiator_io).await.unwrap_err();
        assert!(matches!(err, Error::PeerClosed));
        responder.await.unwrap();
    }
}
