//! Process configuration for the HTTP service, read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub const ADDR_VAR: &str = "FANOUT_ADDR";
pub const TEMPLATE_DIR_VAR: &str = "FANOUT_TEMPLATE_DIR";

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_TEMPLATE_DIR: &str = "templates";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} is not a valid socket address: '{value}'")]
    InvalidAddr { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Root of the template documents, one `<feature>/<step>.yaml` per step.
    pub template_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
        }
    }
}

impl ServerConfig {
    /// Reads `FANOUT_ADDR` and `FANOUT_TEMPLATE_DIR`, falling back to
    /// `127.0.0.1:3000` and `templates`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) but with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = lookup(ADDR_VAR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr: SocketAddr = addr.trim().parse().map_err(|_| ConfigError::InvalidAddr {
            var: ADDR_VAR,
            value: addr.clone(),
        })?;

        let template_dir = lookup(TEMPLATE_DIR_VAR)
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_DIR), PathBuf::from);

        Ok(Self { addr, template_dir })
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = dir.into();
        self
    }
}
