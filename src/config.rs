// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that `sm` reads at startup.
//! Parsing and serialization go through [`FromStr`] and [`Display`], so the
//! only file I/O in here is [`Settings::load_or_create`], which writes out the
//! defaults the first time the tool runs.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{info, instrument};

/// Top-level settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the home directory of every site user.
    pub home_root: PathBuf,

    /// Nginx directory of enabled site configurations.
    pub sites_enabled: PathBuf,

    /// Process supervisor binary.
    pub supervisor: String,

    /// Wall-clock limit for any single external command.
    pub command_timeout_secs: u64,

    /// Port allocation.
    pub ports: PortSettings,

    /// Database server access.
    pub database: DatabaseSettings,

    /// Node.js dependency handling.
    pub node: NodeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home_root: PathBuf::from("/home"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            supervisor: "pm2".into(),
            command_timeout_secs: 600,
            ports: PortSettings::default(),
            database: DatabaseSettings::default(),
            node: NodeSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from path, writing defaults there if the file is missing.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Io`] if the file cannot be read or created.
    /// - Return [`ConfigError::Deserialize`] if the file is not valid.
    #[instrument(skip(path), level = "debug")]
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let settings = Settings::default();
            if let Some(parent) = path.parent() {
                create_dir_all(parent).map_err(|err| ConfigError::Io {
                    source: err,
                    path: parent.to_path_buf(),
                })?;
            }
            write(path, settings.to_string()).map_err(|err| ConfigError::Io {
                source: err,
                path: path.to_path_buf(),
            })?;
            info!("wrote default configuration to {}", path.display());
            return Ok(settings);
        }

        read_to_string(path)
            .map_err(|err| ConfigError::Io {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        settings.home_root = expand_path(&settings.home_root)?;
        settings.sites_enabled = expand_path(&settings.sites_enabled)?;
        settings.ports.table = expand_path(&settings.ports.table)?;

        if settings.ports.start > settings.ports.end {
            return Err(ConfigError::PortRange {
                start: settings.ports.start,
                end: settings.ports.end,
            });
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// How ports are handed out to domains.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortSettings {
    pub start: u16,
    pub end: u16,
    pub strategy: PortStrategy,

    /// Allocation table used by [`PortStrategy::Table`].
    pub table: PathBuf,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            start: 3001,
            end: 3999,
            strategy: PortStrategy::Table,
            table: PathBuf::from("/etc/sitemanager/ports.toml"),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStrategy {
    /// Stable hash of the domain, collisions go unnoticed.
    Hash,

    /// Stable hash seed, collisions resolved through a recorded table.
    #[default]
    Table,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub postgresql: ServerSettings,
    pub mysql: ServerSettings,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            postgresql: ServerSettings::default(),
            mysql: ServerSettings::mysql(),
        }
    }
}

/// Connection details of a local database server.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,

    /// Administrative account used to create roles and databases.
    pub admin_user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            admin_user: "postgres".into(),
            charset: None,
            collation: None,
        }
    }
}

impl ServerSettings {
    pub fn mysql() -> Self {
        Self {
            host: "localhost".into(),
            port: 3306,
            admin_user: "root".into(),
            charset: Some("utf8mb4".into()),
            collation: Some("utf8mb4_unicode_ci".into()),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Extra flags tried in order after a plain `npm install` fails.
    pub install_fallbacks: Vec<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            install_fallbacks: vec!["--legacy-peer-deps".into(), "--force".into()],
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Port range is inverted.
    #[error("port range {start}-{end} is empty")]
    PortRange { start: u16, end: u16 },

    /// Configuration file cannot be read or written.
    #[error("failed to access configuration at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("SITES", "/srv/sites")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            home_root = "$SITES"
            supervisor = "pm2"
            command_timeout_secs = 30

            [ports]
            start = 4000
            end = 4099
            strategy = "hash"
            table = "$SITES/ports.toml"

            [database.mysql]
            host = "127.0.0.1"
            port = 3307
            admin_user = "root"
            charset = "utf8mb4"
        "#
        .parse()?;

        assert_eq!(result.home_root, PathBuf::from("/srv/sites"));
        assert_eq!(result.command_timeout(), Duration::from_secs(30));
        assert_eq!(
            result.ports,
            PortSettings {
                start: 4000,
                end: 4099,
                strategy: PortStrategy::Hash,
                table: PathBuf::from("/srv/sites/ports.toml"),
            }
        );
        assert_eq!(result.database.mysql.port, 3307);
        assert_eq!(result.database.mysql.collation, None);
        assert_eq!(result.database.postgresql, ServerSettings::default());
        assert_eq!(result.sites_enabled, PathBuf::from("/etc/nginx/sites-enabled"));

        Ok(())
    }

    #[test]
    fn reject_inverted_port_range() {
        let result = "[ports]\nstart = 5000\nend = 4000\n".parse::<Settings>();
        assert!(matches!(
            result,
            Err(ConfigError::PortRange {
                start: 5000,
                end: 4000
            })
        ));
    }

    #[test]
    fn load_or_create_writes_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("config.toml");

        let created = Settings::load_or_create(&path)?;
        assert_eq!(created, Settings::default());
        assert!(path.exists());

        let reloaded = Settings::load_or_create(&path)?;
        assert_eq!(reloaded, created);

        Ok(())
    }
}
