//! Bridge configuration and the local origin it serves.
//!
//! Values come from a TOML file (`BridgeConfig::load_from`) or from the
//! environment (`BridgeConfig::from_env`). Every field has a default, so an
//! empty file or an empty environment yields `http://localhost:3000`.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BridgeError, ConfigError};

/// Runtime settings for one bridge installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host part of the local origin.
    pub hostname: String,
    /// Port part of the local origin.
    pub port: u16,
    /// Serve `https://` instead of `http://`.
    pub https: bool,
    /// Log every handled request and every converted failure.
    pub debug: bool,
    /// Development mode: no interception, the embedded app listens on TCP itself.
    pub dev: bool,
    /// Response chunks buffered before the sink reports itself paused.
    pub high_water_mark: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 3000,
            https: false,
            debug: false,
            dev: false,
            high_water_mark: 16,
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `PORT` and the `BRIDGE_*` variables on the defaults.
    /// The host comes from `BRIDGE_HOSTNAME`, never the machine's `HOSTNAME`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(hostname) = lookup("BRIDGE_HOSTNAME") {
            config.hostname = hostname;
        }
        if let Some(port) = lookup("PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a port number: {port}")))?;
        }
        if let Some(value) = lookup("BRIDGE_HTTPS") {
            config.https = parse_flag("BRIDGE_HTTPS", &value)?;
        }
        if let Some(value) = lookup("BRIDGE_DEBUG") {
            config.debug = parse_flag("BRIDGE_DEBUG", &value)?;
        }
        if let Some(value) = lookup("BRIDGE_DEV") {
            config.dev = parse_flag("BRIDGE_DEV", &value)?;
        }
        if let Some(value) = lookup("BRIDGE_HIGH_WATER_MARK") {
            config.high_water_mark = value.parse().map_err(|_| {
                ConfigError::Invalid(format!("BRIDGE_HIGH_WATER_MARK is not a count: {value}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("hostname is required".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port is required".into()));
        }
        if self.high_water_mark == 0 {
            return Err(ConfigError::Invalid("high_water_mark must be at least 1".into()));
        }
        Ok(())
    }

    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    pub fn origin(&self) -> Origin {
        Origin::new(self.scheme(), &self.hostname, self.port)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{key} is not a boolean: {value}"))),
    }
}

/// The scheme, host and port combination the bridge exclusively serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Reject any URL whose scheme, host or effective port differs.
    ///
    /// Default ports are normalised, so `http://localhost/` matches an origin
    /// on port 80. A string-prefix test would wrongly accept `:30001` for `:3000`.
    pub fn check(&self, url: &Url) -> Result<(), BridgeError> {
        let same_host = url
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.host));
        if url.scheme() == self.scheme && same_host && url.port_or_known_default() == Some(self.port) {
            return Ok(());
        }
        Err(BridgeError::OriginMismatch {
            expected: self.to_string(),
            actual: url.origin().ascii_serialization(),
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
