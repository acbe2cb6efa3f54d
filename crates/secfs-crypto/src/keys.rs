//! Per-user asymmetric key material.
//!
//! Every user holds two secrets: an Ed25519 signing key used to sign version
//! structures, and an X25519 secret used to unwrap symmetric file keys that
//! other users wrapped for them. Wrapping is ECIES-style: an ephemeral X25519
//! exchange, HKDF-SHA256 over the shared secret, then AES-256-GCM over the
//! 32-byte file key.

use crate::encryption::{open_with_aad, random_nonce, seal_with_aad, Nonce, SymmetricKey};
use crate::error::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const WRAP_SALT: &[u8] = b"secfs-key-wrap-v1";

/// A user's private key pair. Loaded once per process and never rotated
/// within a session.
pub struct UserKeys {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl std::fmt::Debug for UserKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UserKeys {{ public: {}, secret: [REDACTED] }}",
            self.public_keys().fingerprint()
        )
    }
}

impl UserKeys {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut signing_seed = Zeroizing::new([0u8; 32]);
        let mut exchange_seed = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut signing_seed[..]);
        rng.fill_bytes(&mut exchange_seed[..]);
        Self::from_secret_bytes(&signing_seed, &exchange_seed)
    }

    /// Rebuild a key pair from persisted secret material.
    pub fn from_secret_bytes(signing_seed: &[u8; 32], exchange_secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(signing_seed),
            exchange: StaticSecret::from(*exchange_secret),
        }
    }

    /// Export the secret material for an external key store.
    pub fn secret_bytes(&self) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        (
            Zeroizing::new(self.signing.to_bytes()),
            Zeroizing::new(self.exchange.to_bytes()),
        )
    }

    /// The public half, as published in `.users`.
    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            verifying: self.signing.verifying_key().to_bytes(),
            exchange: PublicKey::from(&self.exchange).to_bytes(),
        }
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Recover a symmetric key that was wrapped for this user.
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<SymmetricKey, CryptoError> {
        let ephemeral = PublicKey::from(wrapped.ephemeral);
        let shared = self.exchange.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "non-contributory ephemeral key".to_string(),
            ));
        }
        let recipient = PublicKey::from(&self.exchange).to_bytes();
        let kek = derive_wrap_key(shared.as_bytes(), &wrapped.ephemeral, &recipient)?;

        let plain = Zeroizing::new(open_with_aad(
            &kek,
            &wrapped.nonce,
            &wrapped.ephemeral,
            &wrapped.ciphertext,
        )?);
        SymmetricKey::from_slice(&plain)
    }
}

/// A user's public keys: signature verification and key wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeys {
    /// Ed25519 verifying key
    pub verifying: [u8; 32],
    /// X25519 public key
    pub exchange: [u8; 32],
}

impl PublicKeys {
    /// Verify that `signature` over `message` was made by this user.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.verifying)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureInvalid)?;
        let sig = Signature::from_bytes(&bytes);
        key.verify_strict(message, &sig)
            .map_err(|_| CryptoError::SignatureInvalid)
    }

    /// Wrap `key` so that only the holder of the matching secret can unwrap it.
    pub fn wrap_key(&self, key: &SymmetricKey) -> Result<WrappedKey, CryptoError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        let ephemeral_secret = StaticSecret::from(*seed);
        let ephemeral = PublicKey::from(&ephemeral_secret).to_bytes();

        let recipient = PublicKey::from(self.exchange);
        let shared = ephemeral_secret.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "non-contributory recipient key".to_string(),
            ));
        }
        let kek = derive_wrap_key(shared.as_bytes(), &ephemeral, &self.exchange)?;

        let nonce = random_nonce();
        let ciphertext = seal_with_aad(&kek, &nonce, &ephemeral, &key.0)?;

        Ok(WrappedKey {
            ephemeral,
            nonce,
            ciphertext,
        })
    }

    /// Short hex fingerprint of the verifying key, for logs.
    pub fn fingerprint(&self) -> String {
        self.verifying[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// A symmetric key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Ephemeral X25519 public key used for this wrap
    pub ephemeral: [u8; 32],
    /// AES-256-GCM nonce
    pub nonce: Nonce,
    /// Wrapped key bytes (32 + 16-byte tag)
    pub ciphertext: Vec<u8>,
}

fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral: &[u8; 32],
    recipient: &[u8; 32],
) -> Result<SymmetricKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(WRAP_SALT), shared);
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(SymmetricKey(okm))
}
