//! Error types for the secfs-crypto subsystem

/// All errors that can occur in the crypto adapter
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch - wrong key, or data tampered
    #[error("Decryption failed: authentication tag mismatch (wrong key or tampered data)")]
    DecryptionAuthFailed,
    /// Ciphertext envelope could not be decoded
    #[error("Malformed ciphertext envelope: {0}")]
    MalformedEnvelope(String),
    /// Signature did not verify against the claimed public key
    #[error("Signature verification failed")]
    SignatureInvalid,
    /// Key material has the wrong shape
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert!(CryptoError::DecryptionAuthFailed
            .to_string()
            .contains("authentication tag"));
        assert_eq!(
            CryptoError::SignatureInvalid.to_string(),
            "Signature verification failed"
        );
        assert!(CryptoError::InvalidKey("short".into())
            .to_string()
            .contains("short"));
    }
}
