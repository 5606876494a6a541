//! Session crypto engine: ML-KEM-512 key encapsulation for establishing a
//! per-session key, ChaCha20-Poly1305 for the chat frames that follow.
//!
//! The session key is the first 32 bytes of the KEM shared secret with no
//! KDF in between. One 12-byte IV is exchanged per session; how it turns into
//! per-message nonces is decided by [`NonceMode`].

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use fips203::ml_kem_512;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use rand::Rng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub const ENCAPSULATION_KEY_LEN: usize = ml_kem_512::EK_LEN;
pub const DECAPSULATION_KEY_LEN: usize = ml_kem_512::DK_LEN;
pub const KEM_CIPHERTEXT_LEN: usize = ml_kem_512::CT_LEN;

/// Raw KEM shared secret, wiped when dropped.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Which end of the direct connection we are. The initiator dialed and sent
/// `CONNECT_REQUEST`; the responder accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    fn direction_marker(self) -> u8 {
        match self {
            Role::Initiator => 0x00,
            Role::Responder => 0x80,
        }
    }
}

/// Decapsulation half of an ML-KEM keypair. Never leaves the process.
pub struct SecretKey(ml_kem_512::DecapsKey);

impl SecretKey {
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        let bytes: [u8; KEM_CIPHERTEXT_LEN] =
            ciphertext
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "KEM ciphertext",
                    expected: KEM_CIPHERTEXT_LEN,
                    actual: ciphertext.len(),
                })?;
        let ct = ml_kem_512::CipherText::try_from_bytes(bytes)
            .map_err(CryptoError::Decapsulation)?;
        let ssk = self.0.try_decaps(&ct).map_err(CryptoError::Decapsulation)?;
        Ok(Zeroizing::new(ssk.into_bytes().to_vec()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Generates a fresh keypair. The public (encapsulation) key is returned in
/// its serialized form, ready to be length-prefixed onto the wire.
pub fn generate_keypair() -> Result<(Vec<u8>, SecretKey), CryptoError> {
    let (ek, dk) = ml_kem_512::KG::try_keygen().map_err(CryptoError::KeyGeneration)?;
    Ok((ek.into_bytes().to_vec(), SecretKey(dk)))
}

/// Encapsulates against a peer's serialized public key, returning the
/// ciphertext to send back and our copy of the shared secret.
pub fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
    let bytes: [u8; ENCAPSULATION_KEY_LEN] =
        public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidLength {
                what: "encapsulation key",
                expected: ENCAPSULATION_KEY_LEN,
                actual: public_key.len(),
            })?;
    let ek = ml_kem_512::EncapsKey::try_from_bytes(bytes).map_err(CryptoError::Encapsulation)?;
    let (ssk, ct) = ek.try_encaps().map_err(CryptoError::Encapsulation)?;
    Ok((
        ct.into_bytes().to_vec(),
        Zeroizing::new(ssk.into_bytes().to_vec()),
    ))
}

/// Takes the first 32 bytes of the shared secret as the session key.
pub fn derive_session_key(shared_secret: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    if shared_secret.len() < KEY_SIZE {
        return Err(CryptoError::ShortSecret(KEY_SIZE));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&shared_secret[..KEY_SIZE]);
    Ok(key)
}

pub fn generate_iv() -> [u8; NONCE_SIZE] {
    let mut iv = [0u8; NONCE_SIZE];
    rand::thread_rng().fill(&mut iv);
    iv
}

/// Symmetric state of one chat session. Wiped on drop; `Debug` never prints
/// the key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionContext {
    key: [u8; KEY_SIZE],
    iv: [u8; NONCE_SIZE],
}

impl EncryptionContext {
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; NONCE_SIZE]) -> Self {
        EncryptionContext { key, iv }
    }

    pub fn from_shared_secret(
        shared_secret: &[u8],
        iv: [u8; NONCE_SIZE],
    ) -> Result<Self, CryptoError> {
        let key = derive_session_key(shared_secret)?;
        Ok(EncryptionContext::new(*key, iv))
    }

    pub fn iv(&self) -> &[u8; NONCE_SIZE] {
        &self.iv
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.key).into())
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// How the session IV becomes a per-message nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceMode {
    /// IV tagged with the sending direction, XOR'ed with a message counter.
    #[default]
    Counter,
    /// Every message reuses the IV unchanged. Only for talking to peers that
    /// expect the legacy behavior: reusing a nonce under one key voids the
    /// cipher's confidentiality guarantees.
    Static,
}

/// Per-direction nonce source. Each chat loop owns exactly one.
#[derive(Debug, Clone)]
pub struct NonceSequence {
    base: [u8; NONCE_SIZE],
    mode: NonceMode,
    counter: u64,
    exhausted: bool,
}

impl NonceSequence {
    /// Nonces for messages written by `sender`.
    pub fn new(iv: &[u8; NONCE_SIZE], sender: Role, mode: NonceMode) -> Self {
        let mut base = *iv;
        if mode == NonceMode::Counter {
            base[0] ^= sender.direction_marker();
        }
        NonceSequence {
            base,
            mode,
            counter: 0,
            exhausted: false,
        }
    }

    pub fn outbound(context: &EncryptionContext, local: Role, mode: NonceMode) -> Self {
        NonceSequence::new(context.iv(), local, mode)
    }

    pub fn inbound(context: &EncryptionContext, local: Role, mode: NonceMode) -> Self {
        NonceSequence::new(context.iv(), local.peer(), mode)
    }

    pub fn current(&self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        match self.mode {
            NonceMode::Static => Ok(self.base),
            NonceMode::Counter => {
                if self.exhausted {
                    return Err(CryptoError::NonceExhausted);
                }
                let mut nonce = self.base;
                for (byte, c) in nonce[4..].iter_mut().zip(self.counter.to_be_bytes()) {
                    *byte ^= c;
                }
                Ok(nonce)
            }
        }
    }

    fn advance(&mut self) {
        if self.mode == NonceMode::Counter {
            match self.counter.checked_add(1) {
                Some(next) => self.counter = next,
                None => self.exhausted = true,
            }
        }
    }
}

/// Encrypts one message; the 16-byte tag is appended to the ciphertext.
pub fn encrypt(
    context: &EncryptionContext,
    nonces: &mut NonceSequence,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = nonces.current()?;
    let sealed = context
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;
    nonces.advance();
    Ok(sealed)
}

/// Inverse of [`encrypt`]. Any tampering with ciphertext or tag is an error
/// and no plaintext is returned. The sequence only advances on success.
pub fn decrypt(
    context: &EncryptionContext,
    nonces: &mut NonceSequence,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::Open);
    }
    let nonce = nonces.current()?;
    let opened = context
        .cipher()
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::Open)?;
    nonces.advance();
    Ok(opened)
}

/// Short digest of the session key material that both users can compare out
/// of band, e.g. `1f3a 9c0e 77b2 4d51`.
pub fn session_fingerprint(context: &EncryptionContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.key);
    hasher.update(context.iv);
    let digest = hasher.finalize();
    digest[..8]
        .chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(" ")
}
