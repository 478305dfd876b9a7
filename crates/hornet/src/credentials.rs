//! Authentication credentials.
//!
//! Loaded from `~/.hornet_authentications.json`. A missing file or a
//! missing section disables the corresponding capability instead of
//! failing startup; the subsystems check availability before use.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

const CREDENTIALS_FILE: &str = ".hornet_authentications.json";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AmqpCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SlackCredentials {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub amqp: AmqpCredentials,
    #[serde(default)]
    pub slack: SlackCredentials,
}

impl Credentials {
    /// Load from the well-known file in the home directory. Problems are
    /// logged and yield empty credentials.
    pub fn load() -> Credentials {
        let Some(path) = Credentials::default_path() else {
            warn!("could not determine the home directory; no credentials loaded");
            return Credentials::default();
        };
        if !path.exists() {
            info!("no credentials file at {}; bus auth and Slack are unavailable", path.display());
            return Credentials::default();
        }
        match Credentials::load_from(&path) {
            Ok(credentials) => {
                info!(
                    "authenticators ready for use: AMQP: {}, Slack: {}",
                    credentials.amqp_available(),
                    credentials.slack_available()
                );
                credentials
            }
            Err(err) => {
                warn!("failed to load credentials from {}: {err:#}", path.display());
                Credentials::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Credentials> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CREDENTIALS_FILE))
    }

    pub fn amqp_available(&self) -> bool {
        !self.amqp.username.is_empty() && !self.amqp.password.is_empty()
    }

    pub fn slack_available(&self) -> bool {
        !self.slack.token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_credentials_file_enables_both() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE);
        std::fs::write(
            &path,
            r#"{"amqp": {"username": "hornet", "password": "s3cret"}, "slack": {"token": "xoxb-1"}}"#,
        )
        .unwrap();
        let credentials = Credentials::load_from(&path).unwrap();
        assert!(credentials.amqp_available());
        assert!(credentials.slack_available());
        assert_eq!(credentials.amqp.username, "hornet");
    }

    #[test]
    fn missing_sections_disable_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE);
        std::fs::write(&path, r#"{"slack": {"token": ""}}"#).unwrap();
        let credentials = Credentials::load_from(&path).unwrap();
        assert!(!credentials.amqp_available());
        assert!(!credentials.slack_available());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE);
        std::fs::write(&path, "not json").unwrap();
        assert!(Credentials::load_from(&path).is_err());
    }
}
