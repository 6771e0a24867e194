//! Configuration management for the Ferry CLI

use ferry_core::Keypair;
use ferry_relay::{RelayClientConfig, RelayServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and host settings
    #[serde(default)]
    pub node: NodeConfig,

    /// Relay server settings (used when serving as a relay)
    #[serde(default)]
    pub relay: RelayServerConfig,

    /// Relay client settings
    #[serde(default)]
    pub client: RelayClientConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// File holding the hex-encoded identity seed
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Run identify over transient (relayed) connections
    #[serde(default)]
    pub identify_transient: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ferry/config.toml")
    }

    /// Load `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.relay.validate()?;
        self.client.validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if let Some(key_file) = &self.node.key_file {
            if key_file.as_os_str().is_empty() {
                anyhow::bail!("node.key_file is empty");
            }
        }

        Ok(())
    }

    /// The configured identity, or a fresh one if none is set
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be read or is not a 32-byte
    /// hex seed.
    pub fn keypair(&self) -> anyhow::Result<Keypair> {
        match &self.node.key_file {
            Some(path) => read_keypair(path),
            None => Ok(Keypair::generate()),
        }
    }
}

/// Read a hex-encoded identity seed
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold 32 bytes.
pub fn read_keypair<P: AsRef<Path>>(path: P) -> anyhow::Result<Keypair> {
    let contents = fs::read_to_string(path.as_ref())?;
    let bytes = hex::decode(contents.trim())?;
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "{} holds {} bytes, expected a 32-byte seed",
            path.as_ref().display(),
            bytes.len()
        )
    })?;
    Ok(Keypair::from_seed(&seed))
}

/// Write an identity seed as hex
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_keypair<P: AsRef<Path>>(keypair: &Keypair, path: P) -> anyhow::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, hex::encode(keypair.seed()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.client.discover_relays, 0);
        assert_eq!(config.relay.reservations.max_reservations, 15);
        assert!(!config.node.identify_transient);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.max_circuits = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.stop_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            discover_relays = 2

            [relay.reservations]
            max_reservations = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.client.discover_relays, 2);
        assert_eq!(config.client.reservation_refresh_margin_secs, 300);
        assert_eq!(config.relay.reservations.max_reservations, 3);
        assert_eq!(config.relay.max_circuits, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.client.discover_relays = 1;
        config.relay.allow_connect_without_reservation = false;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.client, config.client);
        assert_eq!(loaded.relay, config.relay);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!dir.path().join("absent.toml").exists());
    }

    #[test]
    fn test_keypair_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let keypair = Keypair::generate();
        write_keypair(&keypair, &path).unwrap();

        let mut config = Config::default();
        config.node.key_file = Some(path);
        assert_eq!(config.keypair().unwrap().peer_id(), keypair.peer_id());
    }

    #[test]
    fn test_short_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "abcd").unwrap();
        assert!(read_keypair(&path).is_err());
    }
}
