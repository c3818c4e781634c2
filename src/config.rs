//! Configuration surface for the tunnel server and client.
//!
//! Layering follows defaults -> config file -> CLI flags, with each layer
//! only overriding fields the layer above actually set. The file format is
//! TOML, read by the `serve`/`config` subcommands in `bin/main.rs`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().expect("valid default bind addr")
}

const fn default_idle_timeout_secs() -> u64 {
    120
}

const fn default_chunk_size() -> usize {
    crate::headers::CHUNK_SIZE
}

/// Server-side configuration: where to listen, how long an idle virtual
/// connection may live, and an optional sticky-routing URL advertised to
/// clients on their first POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Seconds of inactivity before the reaper closes a connection.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Value to send back as `X-Server-URL` on first-POST responses, used
    /// to pin a client to this instance when several share a front door.
    /// `None` means no sticky header is sent.
    #[serde(default)]
    pub sticky_url: Option<String>,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Overlay `other`'s explicitly-set fields onto `self`, `other` wins.
    /// Used to apply CLI overrides on top of a file-loaded config.
    pub fn merged_with(self, other: PartialServerConfig) -> Self {
        Self {
            bind_addr: other.bind_addr.unwrap_or(self.bind_addr),
            idle_timeout_secs: other.idle_timeout_secs.unwrap_or(self.idle_timeout_secs),
            sticky_url: other.sticky_url.or(self.sticky_url),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sticky_url: None,
        }
    }
}

/// CLI-sourced overrides, every field optional so "not passed" is
/// distinguishable from "passed as the default value".
#[derive(Debug, Clone, Default)]
pub struct PartialServerConfig {
    pub bind_addr: Option<SocketAddr>,
    pub idle_timeout_secs: Option<u64>,
    pub sticky_url: Option<String>,
}

/// Client-side configuration: which tunnel server to dial and how big a
/// chunk the receive pump reads at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            chunk_size: default_chunk_size(),
        }
    }
}
