//! Load config from file, environment and command line, in that order of precedence (last wins).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use meshecho_core::EchoError;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/meshecho/config.toml or /etc/meshecho/config.toml.
/// Env overrides: MESHECHO_IDENTITY_FILE, MESHECHO_DISPLAY_NAME,
/// MESHECHO_ANNOUNCE_INTERVAL_SECONDS, MESHECHO_MAX_OUTBOUND_STAMP_COST,
/// MESHECHO_DISCOVERY_PORT, MESHECHO_LINK_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity file (default ./meshecho_identity).
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
    /// Name carried in announces (default "Echo Bot").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Seconds between periodic announces; 0 or less announces only at startup.
    #[serde(default)]
    pub announce_interval_seconds: i64,
    /// Do not reply to peers asking for a higher stamp cost than this.
    #[serde(default)]
    pub max_outbound_stamp_cost: Option<u8>,
    /// Discovery UDP port (default 4242).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 4243).
    #[serde(default = "default_link_port")]
    pub link_port: u16,
    /// Multicast group for announces and path requests (default 239.255.42.42).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// How long a reply waits for a path to its destination (default 15).
    #[serde(default = "default_path_request_timeout_secs")]
    pub path_request_timeout_secs: u64,
    /// How long a sent reply waits for its delivery proof (default 60).
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    /// Paths not refreshed by an announce for this long are forgotten (default 3600).
    #[serde(default = "default_path_expiry_secs")]
    pub path_expiry_secs: u64,
}

fn default_identity_file() -> PathBuf {
    PathBuf::from("meshecho_identity")
}
fn default_display_name() -> String {
    "Echo Bot".to_string()
}
fn default_discovery_port() -> u16 {
    4242
}
fn default_link_port() -> u16 {
    4243
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 42, 42)
}
fn default_path_request_timeout_secs() -> u64 {
    15
}
fn default_delivery_timeout_secs() -> u64 {
    60
}
fn default_path_expiry_secs() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_file: default_identity_file(),
            display_name: default_display_name(),
            announce_interval_seconds: 0,
            max_outbound_stamp_cost: None,
            discovery_port: default_discovery_port(),
            link_port: default_link_port(),
            multicast_group: default_multicast_group(),
            path_request_timeout_secs: default_path_request_timeout_secs(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
            path_expiry_secs: default_path_expiry_secs(),
        }
    }
}

/// Values given on the command line. `None` keeps the file/env value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub identity_file: Option<PathBuf>,
    pub display_name: Option<String>,
    pub announce_interval_seconds: Option<i64>,
    pub max_outbound_stamp_cost: Option<u8>,
    pub discovery_port: Option<u16>,
    pub link_port: Option<u16>,
}

impl Config {
    pub fn path_request_timeout(&self) -> Duration {
        Duration::from_secs(self.path_request_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn path_expiry(&self) -> Duration {
        Duration::from_secs(self.path_expiry_secs)
    }

    /// Reject parameters the daemon cannot start with.
    pub fn validate(&self) -> Result<(), EchoError> {
        let invalid = |msg: String| Err(EchoError::Configuration(msg));
        if self.identity_file.as_os_str().is_empty() {
            return invalid("identity file path is empty".to_string());
        }
        if self.discovery_port == 0 || self.link_port == 0 {
            return invalid("discovery and link ports must be non-zero".to_string());
        }
        if self.discovery_port == self.link_port {
            return invalid(format!(
                "discovery and link ports must differ (both {})",
                self.link_port
            ));
        }
        if !self.multicast_group.is_multicast() {
            return invalid(format!(
                "{} is not a multicast address",
                self.multicast_group
            ));
        }
        if self.path_request_timeout_secs == 0 || self.delivery_timeout_secs == 0 {
            return invalid("timeouts must be at least one second".to_string());
        }
        if self.path_expiry_secs == 0 {
            return invalid("path expiry must be at least one second".to_string());
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), EchoError> {
        if let Some(v) = var("MESHECHO_IDENTITY_FILE") {
            self.identity_file = PathBuf::from(v);
        }
        if let Some(v) = var("MESHECHO_DISPLAY_NAME") {
            self.display_name = v;
        }
        if let Some(v) = var("MESHECHO_ANNOUNCE_INTERVAL_SECONDS") {
            self.announce_interval_seconds = parse_env("MESHECHO_ANNOUNCE_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = var("MESHECHO_MAX_OUTBOUND_STAMP_COST") {
            self.max_outbound_stamp_cost = Some(parse_env("MESHECHO_MAX_OUTBOUND_STAMP_COST", &v)?);
        }
        if let Some(v) = var("MESHECHO_DISCOVERY_PORT") {
            self.discovery_port = parse_env("MESHECHO_DISCOVERY_PORT", &v)?;
        }
        if let Some(v) = var("MESHECHO_LINK_PORT") {
            self.link_port = parse_env("MESHECHO_LINK_PORT", &v)?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(v) = &o.identity_file {
            self.identity_file = v.clone();
        }
        if let Some(v) = &o.display_name {
            self.display_name = v.clone();
        }
        if let Some(v) = o.announce_interval_seconds {
            self.announce_interval_seconds = v;
        }
        if let Some(v) = o.max_outbound_stamp_cost {
            self.max_outbound_stamp_cost = Some(v);
        }
        if let Some(v) = o.discovery_port {
            self.discovery_port = v;
        }
        if let Some(v) = o.link_port {
            self.link_port = v;
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, EchoError> {
    value
        .trim()
        .parse()
        .map_err(|_| EchoError::Configuration(format!("{} has invalid value {:?}", name, value)))
}

/// Load config: merge default, then config file (explicit or first one found), then env vars,
/// then command line; validate the result.
pub fn load(overrides: &Overrides) -> Result<Config, EchoError> {
    load_with(overrides, |k| std::env::var(k).ok())
}

fn load_with(
    overrides: &Overrides,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Config, EchoError> {
    let mut c = match &overrides.config_file {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(var)?;
    c.apply_overrides(overrides);
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshecho/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshecho/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, EchoError> {
    let s = std::fs::read_to_string(path).map_err(|e| {
        EchoError::Configuration(format!("cannot read config {:?}: {}", path, e))
    })?;
    toml::from_str::<Config>(&s)
        .map_err(|e| EchoError::Configuration(format!("invalid config {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.announce_interval_seconds, 0);
        assert_eq!(c.path_request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn file_then_env_then_cli() {
        let (_dir, path) = write_config(
            "display_name = \"From File\"\nannounce_interval_seconds = 600\nlink_port = 5000\n",
        );
        let env: HashMap<&str, &str> = [
            ("MESHECHO_ANNOUNCE_INTERVAL_SECONDS", "300"),
            ("MESHECHO_LINK_PORT", "5001"),
        ]
        .into_iter()
        .collect();
        let overrides = Overrides {
            config_file: Some(path),
            link_port: Some(5002),
            ..Default::default()
        };
        let c = load_with(&overrides, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.display_name, "From File");
        assert_eq!(c.announce_interval_seconds, 300);
        assert_eq!(c.link_port, 5002);
        assert_eq!(c.discovery_port, 4242);
    }

    #[test]
    fn negative_interval_is_allowed() {
        let (_dir, path) = write_config("");
        let overrides = Overrides {
            config_file: Some(path),
            announce_interval_seconds: Some(-5),
            ..Default::default()
        };
        let c = load_with(&overrides, no_env).unwrap();
        assert_eq!(c.announce_interval_seconds, -5);
    }

    #[test]
    fn unknown_key_is_configuration_error() {
        let (_dir, path) = write_config("proxy_port = 3128\n");
        let overrides = Overrides {
            config_file: Some(path),
            ..Default::default()
        };
        assert!(matches!(
            load_with(&overrides, no_env),
            Err(EchoError::Configuration(_))
        ));
    }

    #[test]
    fn missing_explicit_file_is_configuration_error() {
        let overrides = Overrides {
            config_file: Some(PathBuf::from("/nonexistent/meshecho.toml")),
            ..Default::default()
        };
        assert!(matches!(
            load_with(&overrides, no_env),
            Err(EchoError::Configuration(_))
        ));
    }

    #[test]
    fn bad_env_value_is_configuration_error() {
        let (_dir, path) = write_config("");
        let overrides = Overrides {
            config_file: Some(path),
            ..Default::default()
        };
        let err = load_with(&overrides, |k| {
            (k == "MESHECHO_DISCOVERY_PORT").then(|| "not-a-port".to_string())
        })
        .err()
        .unwrap();
        assert!(format!("{err}").contains("MESHECHO_DISCOVERY_PORT"));
    }

    #[test]
    fn validation_rejects_clashing_ports_and_unicast_group() {
        let c = Config {
            link_port: 4242,
            ..Config::default()
        };
        assert!(c.validate().is_err());
        let c = Config {
            multicast_group: Ipv4Addr::new(10, 0, 0, 1),
            ..Config::default()
        };
        assert!(c.validate().is_err());
        let c = Config {
            delivery_timeout_secs: 0,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }
}
