//! Credential loading.
//!
//! Reads `credentials.json` (gateway API pair + model service key). The
//! interactive session handshake lives in the gateway, not here.

use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Secrets required to talk to the channel gateway and the model service.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub api_id: i64,
    pub api_hash: SecretString,
    pub openai_api_key: SecretString,
}

impl Credentials {
    /// Load credentials from a JSON file.
    ///
    /// A missing file is a configuration error with a hint, not a prompt:
    /// the gateway owns the interactive auth flow.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingRequired {
                key: "credentials".into(),
                hint: format!(
                    "Create {} with api_id, api_hash and openai_api_key",
                    path.display()
                ),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn load_valid_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"api_id": 12345, "api_hash": "abc123", "openai_api_key": "sk-test"}"#,
        )
        .unwrap();

        let creds = Credentials::load(&path).unwrap();
        assert_eq!(creds.api_id, 12345);
        assert_eq!(creds.api_hash.expose_secret(), "abc123");
        assert_eq!(creds.openai_api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn missing_file_is_config_error_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn missing_field_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"api_id": 1}"#).unwrap();
        assert!(matches!(
            Credentials::load(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn secrets_do_not_leak_via_debug() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"api_id": 1, "api_hash": "topsecret", "openai_api_key": "sk-topsecret"}"#,
        )
        .unwrap();
        let creds = Credentials::load(&path).unwrap();
        let debug = format!("{creds:?}");
        assert!(!debug.contains("topsecret"));
    }
}
