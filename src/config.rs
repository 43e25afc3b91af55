//! Configuration module for the remote monitor.
//!
//! Settings come from command-line flags, then `REMOTEMONITOR_*` environment
//! variables, then an optional `KEY=VALUE` config file, then defaults.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

const ENV_PREFIX: &str = "REMOTEMONITOR_";

/// Fatal startup errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("host directory '{}' doesn't exist", .0.display())]
    MissingHostDir(PathBuf),
    #[error("host directory '{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("collector server must not be empty")]
    EmptyServer,
}

/// Command line arguments.
#[derive(Debug, Default, Parser)]
#[command(
    name = "xymon-remotemonitor",
    version,
    about = "Checks hosts and http(s) URLs remotely and reports to a Xymon server"
)]
pub struct Cli {
    /// File of REMOTEMONITOR_*=value lines read below the environment
    #[arg(long = "config", env = "REMOTEMONITOR_CONFIG")]
    pub config: Option<PathBuf>,
    /// Where to find the host definitions
    #[arg(short = 'd', long = "hostdir")]
    pub host_dir: Option<PathBuf>,
    /// Hostname or IP of the Xymon server
    #[arg(short = 's', long = "server")]
    pub server: Option<String>,
    /// Port the Xymon server listens on [default: 1984]
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// Timeout for the connection to the Xymon server, e.g. 3s or 500ms [default: 3s]
    #[arg(short = 't', long = "timeout", value_parser = parse_duration)]
    pub timeout: Option<Duration>,
    /// Per-request HTTP timeout [default: 30s]
    #[arg(long = "http-timeout", value_parser = parse_duration)]
    pub http_timeout: Option<Duration>,
    /// Per-echo ICMP reply timeout [default: 2s]
    #[arg(long = "icmp-timeout", value_parser = parse_duration)]
    pub icmp_timeout: Option<Duration>,
    /// Timeout for one SMTP round trip [default: 30s]
    #[arg(long = "mail-timeout", value_parser = parse_duration)]
    pub mail_timeout: Option<Duration>,
    /// Log level between 1 (panic) and 6 (debug) [default: 4]
    #[arg(short = 'v', long = "loglevel")]
    pub log_level: Option<u8>,
    /// Where to log to, defaults to stdout
    #[arg(short = 'l', long = "logfile")]
    pub log_file: Option<PathBuf>,
    /// Log but don't report to Xymon
    #[arg(long = "dryrun")]
    pub dry_run: bool,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding `*.monitor.json` files
    pub host_dir: PathBuf,
    /// Collector hostname or IP (required)
    pub server: String,
    /// Collector port (default: 1984)
    pub port: u16,
    /// Connection timeout towards the collector (default: 3s)
    pub timeout: Duration,
    /// Per-request HTTP timeout (default: 30s)
    pub http_timeout: Duration,
    /// Per-echo ICMP reply timeout (default: 2s)
    pub icmp_timeout: Duration,
    /// Bound on one whole SMTP dialogue (default: 30s)
    pub mail_timeout: Duration,
    /// Log level between 1 (panic) and 6 (debug) (default: 4, warn)
    pub log_level: u8,
    /// Log file to append to; stdout when unset
    pub log_file: Option<PathBuf>,
    /// Run probes and log, but send nothing to the collector
    pub dry_run: bool,
    /// Problems found while loading. They are logged once logging is up.
    pub warnings: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_dir: PathBuf::from("/etc/xymon-client/remotemonitor/hosts.d/"),
            server: String::new(),
            port: 1984,
            timeout: Duration::from_secs(3),
            http_timeout: Duration::from_secs(30),
            icmp_timeout: Duration::from_secs(2),
            mail_timeout: Duration::from_secs(30),
            log_level: 4,
            log_file: None,
            dry_run: false,
            warnings: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration for the given command line.
    ///
    /// Environment variables (all prefixed with `REMOTEMONITOR_`):
    /// - `HOST_DIR`: monitor definition directory
    /// - `SERVER`: collector hostname
    /// - `PORT`: collector port
    /// - `TIMEOUT`, `HTTP_TIMEOUT`, `ICMP_TIMEOUT`, `MAIL_TIMEOUT`: seconds,
    ///   fractions and `s`/`ms` suffixes allowed
    /// - `LOG_LEVEL`: 1..6
    /// - `LOG_FILE`: path to append logs to
    /// - `DRY_RUN`: `1`, `true`, `yes` or `on`
    pub fn load(cli: &Cli) -> Self {
        let mut warnings = Vec::new();
        let file = match &cli.config {
            Some(path) => read_config_file(path).unwrap_or_else(|e| {
                warnings.push(format!("Ignoring config file {}: {}", path.display(), e));
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        let mut cfg = Self::from_lookup(|key| env::var(key).ok().or_else(|| file.get(key).cloned()));
        warnings.append(&mut cfg.warnings);
        cfg.warnings = warnings;
        cfg.apply_cli(cli);
        cfg
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let warnings = &mut cfg.warnings;

        if let Some(dir) = get("HOST_DIR") {
            cfg.host_dir = PathBuf::from(dir);
        }
        if let Some(server) = get("SERVER") {
            cfg.server = server.trim().to_string();
        }
        if let Some(port) = parse_var(get("PORT"), "PORT", warnings) {
            cfg.port = port;
        }
        if let Some(timeout) = parse_timeout(get("TIMEOUT"), "TIMEOUT", warnings) {
            cfg.timeout = timeout;
        }
        if let Some(timeout) = parse_timeout(get("HTTP_TIMEOUT"), "HTTP_TIMEOUT", warnings) {
            cfg.http_timeout = timeout;
        }
        if let Some(timeout) = parse_timeout(get("ICMP_TIMEOUT"), "ICMP_TIMEOUT", warnings) {
            cfg.icmp_timeout = timeout;
        }
        if let Some(timeout) = parse_timeout(get("MAIL_TIMEOUT"), "MAIL_TIMEOUT", warnings) {
            cfg.mail_timeout = timeout;
        }
        if let Some(level) = parse_var(get("LOG_LEVEL"), "LOG_LEVEL", warnings) {
            cfg.log_level = level;
        }
        if let Some(file) = get("LOG_FILE").filter(|f| !f.is_empty()) {
            cfg.log_file = Some(PathBuf::from(file));
        }
        if let Some(flag) = get("DRY_RUN") {
            cfg.dry_run = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        cfg
    }

    /// Flags given on the command line win over everything else.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.host_dir {
            self.host_dir = dir.clone();
        }
        if let Some(server) = &cli.server {
            self.server = server.trim().to_string();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(timeout) = cli.timeout {
            self.timeout = timeout;
        }
        if let Some(timeout) = cli.http_timeout {
            self.http_timeout = timeout;
        }
        if let Some(timeout) = cli.icmp_timeout {
            self.icmp_timeout = timeout;
        }
        if let Some(timeout) = cli.mail_timeout {
            self.mail_timeout = timeout;
        }
        if let Some(level) = cli.log_level {
            self.log_level = level;
        }
        if let Some(file) = &cli.log_file {
            self.log_file = Some(file.clone());
        }
        self.dry_run |= cli.dry_run;
    }

    /// Check the settings that must hold before any monitor runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.host_dir.exists() {
            return Err(ConfigError::MissingHostDir(self.host_dir.clone()));
        }
        if !self.host_dir.is_dir() {
            return Err(ConfigError::NotADirectory(self.host_dir.clone()));
        }
        if self.server.is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        Ok(())
    }
}

/// `KEY=VALUE` lines; blank lines and `#` comments are skipped.
fn read_config_file(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect())
}

/// Parse `3`, `1.5`, `3s` or `500ms`. A bare number means seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, per_second) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, 1000.0)
    } else if let Some(s) = value.strip_suffix('s') {
        (s, 1.0)
    } else {
        (value, 1.0)
    };

    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {:?}", value))?;
    Duration::try_from_secs_f64(number / per_second).map_err(|e| format!("invalid duration {:?}: {}", value, e))
}

fn parse_var<T: FromStr>(value: Option<String>, name: &str, warnings: &mut Vec<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warnings.push(format!("Ignoring invalid {}{}={:?}", ENV_PREFIX, name, value));
            None
        }
    }
}

fn parse_timeout(value: Option<String>, name: &str, warnings: &mut Vec<String>) -> Option<Duration> {
    let value = value?;
    parse_duration(&value)
        .map_err(|e| warnings.push(format!("Ignoring {}{}: {}", ENV_PREFIX, name, e)))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> AgentConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.port, 1984);
        assert_eq!(cfg.timeout, Duration::from_secs(3));
        assert_eq!(cfg.mail_timeout, Duration::from_secs(30));
        assert_eq!(cfg.log_level, 4);
        assert!(!cfg.dry_run);
        assert!(cfg.server.is_empty());
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn test_overrides() {
        let cfg = from_pairs(&[
            ("SERVER", " xymon.example.com "),
            ("PORT", "1985"),
            ("TIMEOUT", "1.5"),
            ("MAIL_TIMEOUT", "10s"),
            ("LOG_LEVEL", "6"),
            ("LOG_FILE", "/tmp/remotemonitor.log"),
            ("DRY_RUN", "yes"),
        ]);
        assert_eq!(cfg.server, "xymon.example.com");
        assert_eq!(cfg.port, 1985);
        assert_eq!(cfg.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.mail_timeout, Duration::from_secs(10));
        assert_eq!(cfg.log_level, 6);
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/remotemonitor.log")));
        assert!(cfg.dry_run);
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = from_pairs(&[("PORT", "http"), ("TIMEOUT", "-2"), ("DRY_RUN", "maybe")]);
        assert_eq!(cfg.port, 1984);
        assert_eq!(cfg.timeout, Duration::from_secs(3));
        assert!(!cfg.dry_run);
    }

    #[test]
    fn test_invalid_values_are_collected_as_warnings() {
        let cfg = from_pairs(&[("PORT", "http"), ("HTTP_TIMEOUT", "soon")]);
        assert_eq!(cfg.warnings.len(), 2);
        assert_eq!(cfg.warnings[0], "Ignoring invalid REMOTEMONITOR_PORT=\"http\"");
        assert!(cfg.warnings[1].starts_with("Ignoring REMOTEMONITOR_HTTP_TIMEOUT"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("1.5"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("3m").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "xymon-remotemonitor",
            "-d",
            "/srv/hosts.d",
            "-s",
            "xymon",
            "-p",
            "1985",
            "-t",
            "500ms",
            "-v",
            "6",
            "-l",
            "/var/log/remotemonitor.log",
            "--mail-timeout",
            "5s",
            "--dryrun",
        ])
        .unwrap();

        assert_eq!(cli.host_dir, Some(PathBuf::from("/srv/hosts.d")));
        assert_eq!(cli.server.as_deref(), Some("xymon"));
        assert_eq!(cli.port, Some(1985));
        assert_eq!(cli.timeout, Some(Duration::from_millis(500)));
        assert_eq!(cli.mail_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cli.log_level, Some(6));
        assert_eq!(cli.log_file, Some(PathBuf::from("/var/log/remotemonitor.log")));
        assert!(cli.dry_run);
    }

    #[test]
    fn test_cli_rejects_bad_flag_values() {
        assert!(Cli::try_parse_from(["xymon-remotemonitor", "-p", "http"]).is_err());
        assert!(Cli::try_parse_from(["xymon-remotemonitor", "-t", "later"]).is_err());
    }

    #[test]
    fn test_cli_wins_over_environment() {
        let mut cfg = from_pairs(&[("SERVER", "from-env"), ("PORT", "2000"), ("DRY_RUN", "1")]);
        let cli = Cli::try_parse_from(["xymon-remotemonitor", "--server", "from-flag"]).unwrap();
        cfg.apply_cli(&cli);

        assert_eq!(cfg.server, "from-flag");
        assert_eq!(cfg.port, 2000);
        assert!(cfg.dry_run);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "# collector\nREMOTEMONITOR_SERVER = xymon.example.com\n\nREMOTEMONITOR_PORT=1986\n",
        )
        .unwrap();

        let vars = read_config_file(&path).unwrap();
        let cfg = AgentConfig::from_lookup(|key| vars.get(key).cloned());
        assert_eq!(cfg.server, "xymon.example.com");
        assert_eq!(cfg.port, 1986);

        assert!(read_config_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_unreadable_config_file_is_a_warning() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/remotemonitor/config")),
            server: Some("xymon".to_string()),
            ..Default::default()
        };
        let cfg = AgentConfig::load(&cli);

        assert_eq!(cfg.server, "xymon");
        assert!(cfg.warnings[0].starts_with("Ignoring config file /nonexistent/remotemonitor/config"));
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = AgentConfig {
            host_dir: dir.path().to_path_buf(),
            server: "xymon".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());

        cfg.server.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyServer)));

        cfg.server = "xymon".to_string();
        cfg.host_dir = dir.path().join("missing");
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingHostDir(_))));

        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        cfg.host_dir = file;
        assert!(matches!(cfg.validate(), Err(ConfigError::NotADirectory(_))));
    }
}
