use std::path::Path;

use secfs_crypto::EncryptionAlgorithm;
use serde::{Deserialize, Serialize};

/// Client session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// AEAD used for newly written encrypted payloads. Reads follow the
    /// algorithm recorded in each ciphertext envelope.
    pub cipher: EncryptionAlgorithm,
    /// Fail the whole refresh when any version structure is discarded. When
    /// false, the bad entry is logged and that user's files are unreachable
    /// for the refresh.
    pub strict_integrity: bool,
    /// How many times an operation is redone after losing a publish race.
    pub max_conflict_retries: u32,
    /// Largest file size in bytes a write may produce.
    pub max_file_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cipher: EncryptionAlgorithm::AesGcm256,
            strict_integrity: true,
            max_conflict_retries: 3,
            max_file_size: 1 << 30,
        }
    }
}

impl SessionConfig {
    /// Loads settings from a `.toml` or `.json` file. Missing fields keep
    /// their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: SessionConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: SessionConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = SessionConfig::default();
        assert_eq!(config.cipher, EncryptionAlgorithm::AesGcm256);
        assert!(config.strict_integrity);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.max_file_size, 1 << 30);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
cipher = "cha-cha20-poly1305"
strict_integrity = false
max_conflict_retries = 7
max_file_size = 4096
            "#
        )
        .unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cipher, EncryptionAlgorithm::ChaCha20Poly1305);
        assert!(!config.strict_integrity);
        assert_eq!(config.max_conflict_retries, 7);
        assert_eq!(config.max_file_size, 4096);
    }

    #[test]
    fn test_from_file_json_partial() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "max_conflict_retries": 0 }}"#).unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_conflict_retries, 0);
        assert_eq!(config.cipher, EncryptionAlgorithm::AesGcm256);
        assert!(config.strict_integrity);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = SessionConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = SessionConfig {
            cipher: EncryptionAlgorithm::ChaCha20Poly1305,
            strict_integrity: false,
            max_conflict_retries: 1,
            max_file_size: 512,
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
