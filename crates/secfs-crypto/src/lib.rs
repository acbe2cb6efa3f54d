#![warn(missing_docs)]

//! SecFS crypto adapter: payload encryption (AES-GCM / ChaCha20-Poly1305), key wrapping, signing
//!
//! Write path: Plaintext → Encrypt (AEAD, random nonce) → Envelope → Block
//! Read path:  Block → Envelope → Decrypt (auth tag checked) → Plaintext
//!
//! Version structures are signed with each user's Ed25519 key; per-file
//! symmetric keys are wrapped for recipients with X25519 + HKDF + AES-GCM.

pub mod encryption;
pub mod error;
pub mod keys;

pub use encryption::{
    decrypt, encrypt, open, seal, EncryptedPayload, EncryptionAlgorithm, Nonce, SymmetricKey,
};
pub use error::CryptoError;
pub use keys::{PublicKeys, UserKeys, WrappedKey};
