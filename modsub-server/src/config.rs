//! Environment-driven service configuration.

use modsub::types::CursorName;
use std::env;
use std::net::SocketAddr;
use thiserror::Error;

const POSTGRES_URI_VAR: &str = "MODSUB_POSTGRES_URI";
const LISTEN_ADDR_VAR: &str = "MODSUB_LISTEN_ADDR";
const CURSOR_NAME_VAR: &str = "MODSUB_CURSOR_NAME";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_CURSOR_NAME: &str = "subscription-projection";

/// A configuration value that could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    /// A variable is set to a value that does not parse.
    #[error("environment variable {name} has invalid value '{value}': {detail}")]
    Invalid {
        /// Which variable.
        name: &'static str,
        /// The offending value.
        value: String,
        /// Parse failure detail.
        detail: String,
    },
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the projection database and event log.
    pub postgres_uri: String,
    /// Address the HTTP listener binds to.
    pub listen_addr: SocketAddr,
    /// Name of the durable subscription cursor.
    pub cursor_name: CursorName,
}

impl Config {
    /// Reads configuration from the environment.
    ///
    /// `MODSUB_POSTGRES_URI` is required; `MODSUB_LISTEN_ADDR` defaults
    /// to `0.0.0.0:8080` and `MODSUB_CURSOR_NAME` to
    /// `subscription-projection`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let postgres_uri =
            env::var(POSTGRES_URI_VAR).map_err(|_| ConfigError::Missing(POSTGRES_URI_VAR))?;

        let listen_raw =
            env::var(LISTEN_ADDR_VAR).unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_raw.parse().map_err(|err| ConfigError::Invalid {
            name: LISTEN_ADDR_VAR,
            value: listen_raw.clone(),
            detail: format!("{err}"),
        })?;

        let cursor_raw =
            env::var(CURSOR_NAME_VAR).unwrap_or_else(|_| DEFAULT_CURSOR_NAME.to_string());
        let cursor_name =
            CursorName::try_new(cursor_raw.clone()).map_err(|err| ConfigError::Invalid {
                name: CURSOR_NAME_VAR,
                value: cursor_raw,
                detail: format!("{err}"),
            })?;

        Ok(Self {
            postgres_uri,
            listen_addr,
            cursor_name,
        })
    }
}
