//! Monitor definitions and their on-disk discovery.
//!
//! Each managed host is described by one `*.monitor.json` file in the host
//! directory. Field names follow the PascalCase layout used by the existing
//! definition files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name suffix of monitor definitions.
pub const DEFINITION_SUFFIX: &str = ".monitor.json";

/// Errors raised while reading monitor definitions.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to list {}: {source}", path.display())]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One managed host or service and the probes to run against it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MonitorDefinition {
    pub name: String,
    pub machine: String,
    /// Column receiving the aggregate report.
    pub column: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub ping: PingConfig,
    pub http: Vec<HttpTargetConfig>,
    pub smtp: MailConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingConfig {
    pub enabled: bool,
    pub count: u32,
    pub column: String,
}

/// An HTTP(S) virtual host served at the monitor's IP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HttpTargetConfig {
    #[serde(rename = "Https")]
    pub use_tls: bool,
    /// Used for SNI and the Host header; the connection itself goes to the IP.
    pub hostname: String,
    /// Recorded for reference only, requests always use the scheme's default port.
    pub port: u16,
    #[serde(rename = "Path")]
    pub paths: Vec<String>,
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl HttpTargetConfig {
    /// Basic-auth credentials, if a non-empty user is configured.
    pub fn credentials(&self) -> Option<(&str, Option<&str>)> {
        match self.user.as_deref() {
            Some(user) if !user.is_empty() => Some((user, self.password.as_deref())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MailUser {
    pub address: String,
    /// Accepted for compatibility; the mail check never authenticates.
    pub user_name: String,
    /// Accepted for compatibility; the mail check never authenticates.
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MailConfig {
    pub enabled: bool,
    pub port: u16,
    pub sender: MailUser,
    pub recipient: MailUser,
    pub subject: String,
    pub message: String,
    pub column: String,
}

/// Read a single definition file.
pub fn read_definition(path: &Path) -> Result<MonitorDefinition, LoadError> {
    let raw = fs::read(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every definition in `dir`, keyed by file name.
///
/// Files that cannot be read or parsed are logged and skipped. Only a failure
/// to list the directory itself is an error.
pub fn load_monitors(dir: &Path) -> Result<BTreeMap<String, MonitorDefinition>, LoadError> {
    let entries = fs::read_dir(dir).map_err(|source| LoadError::ListDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut monitors = BTreeMap::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::error!("Failed to read entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(DEFINITION_SUFFIX) {
            continue;
        }

        match read_definition(&entry.path()) {
            Ok(monitor) => {
                tracing::debug!("Loaded monitor {} from {}", monitor.name, file_name);
                monitors.insert(file_name, monitor);
            }
            Err(e) => tracing::error!(file = %file_name, "Skipping monitor definition: {}", e),
        }
    }

    Ok(monitors)
}
