//! Settings for the `hl7sim` binary, read from a TOML file.
//!
//! Every key is optional. Command line flags override whatever the file says.
//!
//! ```toml
//! template_dirs = ["templates", "/etc/hl7sim/templates"]
//! data_dir = "data"
//! host = "127.0.0.1"
//! send_port = 11011
//! listen_port = 22022
//! ack_timeout_secs = 5
//! message_start = "MSH|"
//! ```

use log::debug;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::SendOptions;
use crate::error::ConfigError;

/// Looked for in the working directory when no file is named explicitly
pub const DEFAULT_CONFIG_FILE: &str = "hl7sim.toml";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Searched in order for template documents
    pub template_dirs: Vec<PathBuf>,
    /// Where `$DAT` and `$B64` look for their files
    pub data_dir: PathBuf,
    pub host: String,
    pub send_port: u16,
    pub listen_port: u16,
    pub ack_timeout_secs: u64,
    pub message_start: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            template_dirs: vec![
                PathBuf::from("templates"),
                PathBuf::from("/etc/hl7sim/templates"),
            ],
            data_dir: PathBuf::from("data"),
            host: "127.0.0.1".to_string(),
            send_port: 11011,
            listen_port: 22022,
            ack_timeout_secs: 5,
            message_start: "MSH|".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from [`DEFAULT_CONFIG_FILE`] if it happens to exist.
    ///
    /// A file named explicitly must exist; the default file is optional and its absence just
    /// means defaults.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.display().to_string()));
                }
                Self::from_file(path)
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    debug!("No {} found, using default settings", DEFAULT_CONFIG_FILE);
                    Ok(Settings::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Settings, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(contents.parse()?)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            ack_timeout: self.ack_timeout(),
            message_start: self.message_start.as_bytes().to_vec(),
        }
    }
}

impl std::str::FromStr for Settings {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings: Settings = "".parse().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.send_port, 11011);
        assert_eq!(settings.listen_port, 22022);
    }

    #[test]
    fn partial_file_overrides_only_its_keys() {
        let settings: Settings = r#"
            host = "10.0.0.5"
            ack_timeout_secs = 30
            template_dirs = ["/srv/templates"]
        "#
        .parse()
        .unwrap();

        assert_eq!(settings.host, "10.0.0.5");
        assert_eq!(settings.ack_timeout(), Duration::from_secs(30));
        assert_eq!(settings.template_dirs, vec![PathBuf::from("/srv/templates")]);
        assert_eq!(settings.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!("sned_port = 1".parse::<Settings>().is_err());
    }

    #[test]
    fn send_options_follow_settings() {
        let settings: Settings = "message_start = \"FHS|\"\nack_timeout_secs = 2".parse().unwrap();
        let options = settings.send_options();
        assert_eq!(options.message_start, b"FHS|".to_vec());
        assert_eq!(options.ack_timeout, Duration::from_secs(2));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Settings::load(Some(&missing)),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn loads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        fs::write(&path, "send_port = 2575\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.send_port, 2575);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "send_port = \"not a number\"\n").unwrap();

        assert!(matches!(
            Settings::load(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }
}
