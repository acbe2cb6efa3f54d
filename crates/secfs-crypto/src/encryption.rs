//! AES-256-GCM and ChaCha20-Poly1305 AEAD encryption of file and directory payloads

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 256-bit (32-byte) symmetric key for a file or directory payload.
///
/// Supplied by the caller on every call and never cached by the filesystem
/// layer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub [u8; 32]);

impl SymmetricKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        SymmetricKey(bytes)
    }

    /// Build a key from a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(SymmetricKey(arr))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 12]);

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM - hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305 - constant-time, fast on non-AES hardware
    ChaCha20Poly1305,
}

/// Encrypted payload: ciphertext (with 16-byte auth tag), nonce, algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Ciphertext with 16-byte AEAD authentication tag appended
    pub ciphertext: Vec<u8>,
    /// Nonce used for this encryption operation
    pub nonce: Nonce,
    /// Algorithm (needed for decryption)
    pub algo: EncryptionAlgorithm,
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> Nonce {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    Nonce(bytes)
}

impl EncryptionAlgorithm {
    /// Associated data bound into every payload sealed with this algorithm,
    /// so an envelope relabelled with another algorithm fails to open.
    fn label(self) -> &'static [u8] {
        match self {
            EncryptionAlgorithm::AesGcm256 => b"secfs-payload/aes-256-gcm",
            EncryptionAlgorithm::ChaCha20Poly1305 => b"secfs-payload/chacha20-poly1305",
        }
    }
}

/// A keyed AEAD instance for one of the supported algorithms.
enum Cipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl Cipher {
    fn new(algo: EncryptionAlgorithm, key: &SymmetricKey) -> Result<Self, CryptoError> {
        let cipher = match algo {
            EncryptionAlgorithm::AesGcm256 => Aes256Gcm::new_from_slice(&key.0)
                .map(|c| Cipher::Aes(Box::new(c))),
            EncryptionAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.0)
                .map(|c| Cipher::ChaCha(Box::new(c))),
        };
        cipher.map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    fn seal(&self, nonce: &Nonce, aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let n = aes_gcm::Nonce::from_slice(&nonce.0);
        let payload = Payload { msg, aad };
        let result = match self {
            Cipher::Aes(c) => c.encrypt(n, payload),
            Cipher::ChaCha(c) => c.encrypt(n, payload),
        };
        result.map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    fn open(&self, nonce: &Nonce, aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let n = aes_gcm::Nonce::from_slice(&nonce.0);
        let payload = Payload { msg, aad };
        let result = match self {
            Cipher::Aes(c) => c.decrypt(n, payload),
            Cipher::ChaCha(c) => c.decrypt(n, payload),
        };
        result.map_err(|_| CryptoError::DecryptionAuthFailed)
    }
}

/// AES-256-GCM under a raw key with caller-chosen associated data. Used
/// for key wrapping, where the key is derived per wrap.
pub(crate) fn seal_with_aad(
    key: &SymmetricKey,
    nonce: &Nonce,
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Cipher::new(EncryptionAlgorithm::AesGcm256, key)?.seal(nonce, aad, msg)
}

/// Inverse of [`seal_with_aad`].
pub(crate) fn open_with_aad(
    key: &SymmetricKey,
    nonce: &Nonce,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Cipher::new(EncryptionAlgorithm::AesGcm256, key)?.open(nonce, aad, ciphertext)
}

/// Encrypt plaintext under a fresh random nonce.
pub fn encrypt(
    plaintext: &[u8],
    key: &SymmetricKey,
    algo: EncryptionAlgorithm,
) -> Result<EncryptedPayload, CryptoError> {
    let nonce = random_nonce();
    let ciphertext = Cipher::new(algo, key)?.seal(&nonce, algo.label(), plaintext)?;
    Ok(EncryptedPayload {
        ciphertext,
        nonce,
        algo,
    })
}

/// Decrypt an [`EncryptedPayload`]. A wrong key, a tampered ciphertext and
/// a relabelled algorithm all fail with `DecryptionAuthFailed`.
pub fn decrypt(payload: &EncryptedPayload, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    Cipher::new(payload.algo, key)?.open(&payload.nonce, payload.algo.label(), &payload.ciphertext)
}

/// Encrypt and serialize into a self-describing envelope suitable for a block.
pub fn seal(
    plaintext: &[u8],
    key: &SymmetricKey,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, CryptoError> {
    let payload = encrypt(plaintext, key, algo)?;
    bincode::serialize(&payload).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decode an envelope produced by [`seal`] and decrypt it.
pub fn open(envelope: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let payload: EncryptedPayload = bincode::deserialize(envelope)
        .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
    decrypt(&payload, key)
}
