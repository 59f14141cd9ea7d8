//! Server configuration.
//!
//! All options have defaults, so an empty TOML document is a valid config:
//!
//! ```toml
//! port = 8080
//! address = "127.0.0.1"
//! logging = true
//! enable_context = true
//! time_format = "milliseconds"
//!
//! [cors]
//! origin = ["https://app.example.com"]
//! credentials = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::middleware::cookies::CookieOptions;
use crate::middleware::cors::CorsConfig;

const DEFAULT_PORT: u16 = 3000;

/// Root configuration for a [`Server`](crate::Server).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port. `0` asks the OS for a free one.
    pub port: u16,

    /// Listening address.
    pub address: String,

    /// Scope every request in an [`Execution`](crate::context::Execution).
    pub enable_context: bool,

    /// Emit one access log line per finalized response.
    pub logging: bool,

    /// Parse the `Cookie` header before middleware runs.
    pub cookies: bool,

    /// Defaults applied by the cookie jar (signing secrets, path, flags).
    pub cookies_options: CookieOptions,

    /// Resolve the peer address to a host name during preprocessing.
    /// Needs a resolver attached with [`Server::reverse_resolver`](crate::Server::reverse_resolver).
    pub reverse_dns: bool,

    /// Enables the CORS preprocessing step when present.
    pub cors: Option<CorsConfig>,

    /// Attach `X-Processing-Time` headers in the given unit.
    pub time_format: Option<TimeFormat>,

    /// Buffer and classify `POST`/`PUT`/`PATCH` bodies before middleware runs.
    pub parse_body: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: port_from_env().unwrap_or(DEFAULT_PORT),
            address: "0.0.0.0".to_owned(),
            enable_context: false,
            logging: false,
            cookies: false,
            cookies_options: CookieOptions::default(),
            reverse_dns: false,
            cors: None,
            time_format: None,
            parse_body: true,
        }
    }
}

impl ServerConfig {
    /// Parses a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// `address:port` as handed to the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn port_from_env() -> Option<u16> {
    std::env::var("PORT").ok()?.parse().ok()
}

/// Unit of the processing-time response header.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    #[serde(alias = "s")]
    Seconds,
    #[serde(alias = "ms")]
    Milliseconds,
}

impl TimeFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seconds      => "seconds",
            Self::Milliseconds => "milliseconds",
        }
    }

    pub(crate) fn measure(self, elapsed: std::time::Duration) -> f64 {
        match self {
            Self::Seconds      => elapsed.as_secs_f64(),
            Self::Milliseconds => elapsed.as_secs_f64() * 1e3,
        }
    }
}
