//! Layered configuration.
//!
//! Uses figment to merge, later sources winning:
//! 1. Default values
//! 2. The TOML file named by `SDBUSPLUS_CONFIG`, if set
//! 3. Environment variables prefixed `SDBUSPLUS_`, nested with `__`
//!    (`SDBUSPLUS_BUS__KIND=system`)

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sdbus::native::DEFAULT_METHOD_TIMEOUT_USEC;

const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/run/dbus/system_bus_socket";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub context: ContextConfig,
}

/// Which bus to connect to when no explicit address is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// The user bus if a session address is known, else the system bus.
    #[default]
    Default,
    User,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Explicit bus address; overrides discovery through `kind`.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub kind: BusKind,

    /// Timeout for calls made with the default (zero) timeout.
    #[serde(default = "default_method_timeout_usec")]
    pub method_timeout_usec: u64,

    /// Register with the bus daemon (`Hello`) after connecting.
    #[serde(default = "default_true")]
    pub bus_client: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Run the watchdog task when the service manager asks for one.
    #[serde(default = "default_true")]
    pub watchdog: bool,
}

fn default_method_timeout_usec() -> u64 {
    DEFAULT_METHOD_TIMEOUT_USEC
}

fn default_true() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: None,
            kind: BusKind::Default,
            method_timeout_usec: default_method_timeout_usec(),
            bus_client: true,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { watchdog: true }
    }
}

fn env_address(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|a| !a.is_empty())
}

impl BusConfig {
    /// The address to connect to: the explicit one, or the one discovered
    /// from the environment for `kind`.
    pub fn resolve_address(&self) -> Result<String> {
        if let Some(address) = &self.address {
            return Ok(address.clone());
        }
        let session = env_address("DBUS_SESSION_BUS_ADDRESS");
        let system = || {
            env_address("DBUS_SYSTEM_BUS_ADDRESS")
                .unwrap_or_else(|| DEFAULT_SYSTEM_BUS_ADDRESS.to_string())
        };
        match self.kind {
            BusKind::User => session.ok_or_else(|| {
                Error::Config("DBUS_SESSION_BUS_ADDRESS is not set".to_string())
            }),
            BusKind::System => Ok(system()),
            BusKind::Default => Ok(session.unwrap_or_else(system)),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = std::env::var_os("SDBUSPLUS_CONFIG") {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("SDBUSPLUS_").ignore(&["config"]).split("__"));

        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}
