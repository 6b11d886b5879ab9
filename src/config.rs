//! Server configuration file.
//!
//! ```toml
//! [display]
//! number = 1
//! reset = true
//!
//! [listen]
//! unix_dir = "/tmp/.X11-unix"
//! tcp = "127.0.0.1"
//!
//! [auth]
//! file = "/home/me/.Xauthority"
//! hosts = ["10.0.0.7"]
//!
//! [os]
//! max_clients = 64
//!
//! [logging]
//! filter = "x11os=debug"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use x11os_core::{HostList, ListenOptions, OsConfig, X11_UNIX_DIR};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub display: DisplayConfig,
    pub listen: ListenConfig,
    pub auth: AuthConfig,
    pub os: OsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    pub number: u32,
    /// Reset the server when the last client disconnects.
    pub reset: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    /// Directory for the Unix socket; `None` disables it.
    pub unix_dir: Option<PathBuf>,
    /// Address for the TCP listener on port 6000 + display.
    pub tcp: Option<IpAddr>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            unix_dir: Some(PathBuf::from(X11_UNIX_DIR)),
            tcp: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Authority file read at startup and on every reset.
    pub file: Option<PathBuf>,
    /// Hosts admitted without credentials.
    pub hosts: Vec<IpAddr>,
    /// Admit local connections without credentials.
    pub local: bool,
    pub disable_access_control: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            file: None,
            hosts: Vec::new(),
            local: true,
            disable_access_control: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            unix_dir: self.listen.unix_dir.clone(),
            tcp: self.listen.tcp,
        }
    }

    pub fn host_list(&self) -> HostList {
        let mut hosts = HostList::default();
        hosts.set_enabled(!self.auth.disable_access_control);
        hosts.set_local(self.auth.local);
        for &host in &self.auth.hosts {
            hosts.add(host);
        }
        hosts
    }
}
