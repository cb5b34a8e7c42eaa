//! Loads the settings shared by every run: target hosts, SSH options, runner options and
//! variables.
//!
//! The configuration is an ordinary value passed to the code that needs it. Nothing here is
//! global.

use crate::run_plan::RunnerOptions;
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a [PathBuf] to the directory where the configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/provision`.
/// Otherwise, it returns `/etc/provision`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/provision";

    let mut path = PathBuf::from("/");

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }

    path.push(CONFIG_DIR);
    path
}

/// Returns the path of the configuration file read when none is given explicitly.
pub fn default_config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Everything the `provision` binary needs besides plan files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Hosts to run plans on, in order.
    pub hosts: Vec<String>,

    pub ssh: SshConfig,

    pub runner: RunnerOptions,

    /// Variables available to every plan. Plan variables take precedence.
    pub vars: IndexMap<String, String>,
}

impl Config {
    /// Reads a [Config] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("could not parse config file {}", path.display()))
    }

    /// Reads the [default_config_file] if it exists and returns defaults otherwise.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = default_config_file();
        let exists = path
            .try_exists()
            .with_context(|| format!("could not check for config file {}", path.display()))?;
        match exists {
            true => Self::load(path),
            false => Ok(Self::default()),
        }
    }
}

/// How to check a host's key against `known_hosts`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    /// Refuse unknown hosts.
    Strict,

    /// Add unknown hosts to `known_hosts`, but refuse changed keys.
    #[default]
    Add,

    /// Accept any key. Only for throwaway test machines.
    Accept,
}

/// Options for opening SSH connections.
///
/// Unset fields fall back to the user's SSH configuration (`~/.ssh/config`) and then to OpenSSH
/// defaults.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    /// The login user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Whether to read `~/.ssh/config`.
    pub use_ssh_config: bool,

    /// Private key to authenticate with. A leading `~/` means the user's home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,

    pub known_hosts: KnownHostsPolicy,

    /// Seconds to wait for a connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: None,
            port: None,
            use_ssh_config: true,
            identity_file: None,
            known_hosts: KnownHostsPolicy::default(),
            connect_timeout: None,
        }
    }
}

impl SshConfig {
    /// Returns [Self::identity_file] with `~` expanded.
    pub fn identity_file(&self) -> Option<PathBuf> {
        let file = self.identity_file.as_deref()?;
        match file.strip_prefix("~/") {
            Some(rest) => match home::home_dir() {
                Some(home) => Some(home.join(rest)),
                None => Some(PathBuf::from(file)),
            },
            None => Some(PathBuf::from(file)),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.map(Duration::from_secs)
    }
}
