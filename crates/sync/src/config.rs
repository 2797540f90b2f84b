//! Runtime configuration for the sync layer.

use std::time::Duration;

use crate::error::ConfigError;
use stockyard_core::sync::{DEFAULT_PAGE_SIZE, DEFAULT_STALE_TIME_SECS};
use stockyard_realtime::{FrameProtocol, ReconnectPolicy, SocketConfig};

pub const API_URL_VAR: &str = "STOCKYARD_API_URL";
pub const SOCKET_URL_VAR: &str = "STOCKYARD_SOCKET_URL";
pub const STALE_SECS_VAR: &str = "STOCKYARD_STALE_SECS";
pub const PAGE_SIZE_VAR: &str = "STOCKYARD_PAGE_SIZE";
pub const ACCESS_TOKEN_VAR: &str = "STOCKYARD_ACCESS_TOKEN";

const SOCKET_IO_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub socket_url: String,
    pub access_token: Option<String>,
    /// Window during which cached reads skip the network.
    pub stale_time: Duration,
    pub page_size: u64,
    pub protocol: FrameProtocol,
    pub reconnect: ReconnectPolicy,
}

impl SyncConfig {
    /// Config for `api_url` with every other setting at its default.
    pub fn new(api_url: &str) -> Self {
        let api_url = api_url.trim().trim_end_matches('/').to_string();
        Self {
            socket_url: default_socket_url(&api_url),
            api_url,
            access_token: None,
            stale_time: Duration::from_secs(DEFAULT_STALE_TIME_SECS),
            page_size: DEFAULT_PAGE_SIZE,
            protocol: FrameProtocol::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Read the config from `STOCKYARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`SyncConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_url = read(API_URL_VAR).ok_or(ConfigError::Missing(API_URL_VAR))?;
        let mut config = Self::new(&api_url);

        if let Some(socket_url) = read(SOCKET_URL_VAR) {
            config.socket_url = socket_url;
        }
        config.access_token = read(ACCESS_TOKEN_VAR);
        if let Some(value) = read(STALE_SECS_VAR) {
            let secs = parse_number(STALE_SECS_VAR, &value)?;
            config.stale_time = Duration::from_secs(secs);
        }
        if let Some(value) = read(PAGE_SIZE_VAR) {
            let size = parse_number(PAGE_SIZE_VAR, &value)?;
            if size == 0 {
                return Err(ConfigError::Invalid {
                    name: PAGE_SIZE_VAR,
                    value,
                });
            }
            config.page_size = size;
        }
        Ok(config)
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig::new(self.socket_url.clone())
            .with_access_token(self.access_token.clone())
            .with_protocol(self.protocol)
            .with_reconnect(self.reconnect.clone())
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

/// `https://host/api` becomes `wss://host/socket.io/?EIO=4&transport=websocket`.
fn default_socket_url(api_url: &str) -> String {
    let (scheme, rest) = match api_url.split_once("://") {
        Some(("https", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", api_url),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{}://{}{}", scheme, host, SOCKET_IO_PATH)
}
