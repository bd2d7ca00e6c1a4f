// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{backend::local, framing::Framing, session::Options};

/// Configuration for a provisioning run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The serial port the device is attached to.
    #[serde(default)]
    pub serial: SerialPort,
    /// Pacing and timeouts for the framed handshake.
    #[serde(default)]
    pub framing: Framing,
    /// Session-level delays.
    #[serde(default)]
    pub session: Options,
    /// Settings for the local certificate authority and device registry.
    #[serde(default)]
    pub local: local::Config,
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// The serial port settings.
///
/// The port is always opened as 8 data bits, no parity, one stop bit, which is what the
/// provisioning firmware configures its UART as.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialPort {
    /// The path to the serial device, for example `/dev/ttyACM0`.
    pub port: String,
    /// The baud rate; the default is 115200.
    pub baud_rate: u32,
}

impl Default for SerialPort {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
        }
    }
}

fn private_load_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::debug!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    // The rendered defaults should be a valid configuration file.
    #[test]
    fn default_round_trips() -> anyhow::Result<()> {
        let rendered = Config::default().to_string();
        let parsed: Config = toml::from_str(&rendered)?;

        assert_eq!(parsed.serial.baud_rate, 115_200);
        assert_eq!(parsed.framing.read_timeout, Duration::from_secs(20));
        assert_eq!(parsed.framing.chunk_size.get(), 1);
        assert_eq!(parsed.session.settle_delay, Duration::from_secs(1));
        Ok(())
    }

    // Sections left out of the file fall back to their defaults.
    #[test]
    fn partial_config() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyUSB3"
            baud_rate = 9600
            "#,
        )?;

        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.framing.char_delay, Duration::from_millis(10));
        assert_eq!(config.local.policy_name, "DemoPolicy");
        Ok(())
    }

    #[test]
    fn explicit_path_is_loaded() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[local]\nendpoint = \"iot.example.com\"\n")?;

        let config: Config = load_config(Some(path), std::path::Path::new("unused.toml"))?;
        assert_eq!(config.local.endpoint, "iot.example.com");
        Ok(())
    }

    #[test]
    fn invalid_config_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[serial]\nbaud_rate = \"fast\"\n")?;

        let result: anyhow::Result<Config> =
            load_config(Some(path), std::path::Path::new("unused.toml"));
        assert!(result.is_err());
        Ok(())
    }
}
