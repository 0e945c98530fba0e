//! Pluggable crypto capabilities: key exchange, symmetric packet cipher and
//! handshake signatures.
//!
//! The shipped defaults are X25519 key agreement (hashed into an AES-256-GCM
//! session key with SHA-256) and Ed25519 challenge signatures. Alternative
//! algorithms plug in through [`CryptoProvider`].

use crate::error::TransportError;
use aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use x25519_dalek::{PublicKey, StaticSecret};

/// One half of an ephemeral key agreement, created per handshake.
pub trait KeyExchange: Send + Sync {
    /// The public half shipped in REQUEST / ACCEPT packets.
    fn public_key(&self) -> Vec<u8>;

    /// Combine our private half with the remote public half into a packet
    /// cipher for the connection.
    fn derive(&self, remote_public: &[u8]) -> Result<Box<dyn PacketCipher>, TransportError>;
}

/// Symmetric authenticated encryption of a packet's message region.
pub trait PacketCipher: Send + Sync {
    /// Bytes the ciphertext is longer than the plaintext (nonce + tag).
    fn overhead(&self) -> usize;

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Signs handshake challenges with the host's long-term identity key.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

/// Factory for the capability set a host uses.
pub trait CryptoProvider: Send + Sync {
    fn new_key_exchange(&self) -> Box<dyn KeyExchange>;

    /// A signer from a private key seed, or with a freshly generated key.
    fn new_signer(&self, private_key: Option<&[u8; 32]>) -> Box<dyn Signer>;

    /// Verify `signature` over `data` against a remote identity key.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8])
        -> Result<(), TransportError>;

    /// Fill `out` with cryptographically secure random bytes.
    fn random_bytes(&self, out: &mut [u8]);
}

/// X25519 + SHA-256 + AES-256-GCM + Ed25519.
pub struct DefaultCrypto;

impl CryptoProvider for DefaultCrypto {
    fn new_key_exchange(&self) -> Box<dyn KeyExchange> {
        Box::new(X25519KeyExchange::generate())
    }

    fn new_signer(&self, private_key: Option<&[u8; 32]>) -> Box<dyn Signer> {
        Box::new(match private_key {
            Some(seed) => Ed25519Signer::from_seed(seed),
            None => Ed25519Signer::generate(),
        })
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8])
        -> Result<(), TransportError>
    {
        let key_bytes: [u8; 32] = public_key.try_into()
            .map_err(|_| TransportError::Crypto("identity key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| TransportError::Crypto(format!("invalid identity key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| TransportError::Crypto(format!("invalid signature encoding: {e}")))?;

        key.verify(data, &signature)
            .map_err(|_| TransportError::BadSignature)
    }

    fn random_bytes(&self, out: &mut [u8]) {
        OsRng.fill_bytes(out);
    }
}

pub struct X25519KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyExchange {
    pub fn generate() -> X25519KeyExchange {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        X25519KeyExchange { secret, public }
    }
}

impl KeyExchange for X25519KeyExchange {
    fn public_key(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    fn derive(&self, remote_public: &[u8]) -> Result<Box<dyn PacketCipher>, TransportError> {
        let remote: [u8; 32] = remote_public.try_into()
            .map_err(|_| TransportError::Crypto("exchange key must be 32 bytes".to_string()))?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        // hash the curve point so the session key is uniformly distributed
        let key: [u8; 32] = Sha256::digest(shared.as_bytes()).into();
        Ok(Box::new(Aes256GcmCipher::new(&key)))
    }
}

/// AES-256-GCM with a 12-byte nonce carried in front of each ciphertext:
/// 4 random bytes fixed per cipher instance plus a 64-bit counter.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

impl Aes256GcmCipher {
    pub fn new(key: &[u8; 32]) -> Aes256GcmCipher {
        Aes256GcmCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_fixed: OsRng.next_u32(),
            nonce_counter: AtomicU64::new(0),
        }
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_le_bytes());
        nonce[4..].copy_from_slice(
            &self.nonce_counter.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        nonce
    }
}

impl PacketCipher for Aes256GcmCipher {
    fn overhead(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, TransportError> {
        let nonce = self.next_nonce();
        let ciphertext = self.cipher.encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| TransportError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, TransportError> {
        if cipher.len() < NONCE_LEN + TAG_LEN {
            return Err(TransportError::Crypto("ciphertext shorter than nonce and tag".to_string()));
        }
        let (nonce, ciphertext) = cipher.split_at(NONCE_LEN);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TransportError::Crypto("decryption tag mismatch".to_string()))
    }
}

pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Ed25519Signer {
        Ed25519Signer { key: SigningKey::generate(&mut OsRng) }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Ed25519Signer {
        Ed25519Signer { key: SigningKey::from_bytes(seed) }
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.key.sign(data).to_bytes().to_vec()
    }
}
