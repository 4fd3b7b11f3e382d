use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSettings;
use crate::error::{ChatError, ChatResult};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    api_url = "https://chat.example.com"
//
//   env var:         CHAT_SERVER__API_URL=https://chat.example.com
//
//   (double underscore = nesting, single underscore stays within field names)

pub const ENV_PREFIX: &str = "CHAT_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
}

/// Backend endpoints (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Derived from `api_url` when unset.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Duplex connection tunables (`[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Session list behavior (`[sessions]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_title")]
    pub default_title: String,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            default_title: default_title(),
        }
    }
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_page_size() -> u32 {
    50
}
fn default_title() -> String {
    "New Conversation".to_string()
}

/// `~/.config/chat-stream` (or the platform equivalent).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chat-stream"))
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_SERVER__API_URL=...`  →  `server.api_url = ...`
///   `CHAT_CONNECTION__CONNECT_TIMEOUT_SECS=5`  →  `connection.connect_timeout_secs = 5`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(ClientFileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime config (validated from ClientFileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the HTTP API.
    pub api_url: Url,
    pub request_timeout: Duration,
    pub connection: ConnectionSettings,
    pub page_size: u32,
    /// Title used when a session must be created implicitly.
    pub default_title: String,
}

impl ClientConfig {
    pub fn from_file(fc: &ClientFileConfig) -> ChatResult<Self> {
        let api_url = parse_url("server.api_url", &fc.server.api_url)?;
        let ws_url = match &fc.server.ws_url {
            Some(raw) => parse_url("server.ws_url", raw)?,
            None => derive_ws_url(&api_url)?,
        };

        if fc.connection.outbound_buffer == 0 {
            return Err(ChatError::Config(
                "connection.outbound_buffer must be at least 1".to_string(),
            ));
        }
        if fc.sessions.page_size == 0 {
            return Err(ChatError::Config(
                "sessions.page_size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            api_url,
            request_timeout: Duration::from_secs(fc.server.request_timeout_secs),
            connection: ConnectionSettings {
                ws_url,
                connect_timeout: Duration::from_secs(fc.connection.connect_timeout_secs),
                outbound_buffer: fc.connection.outbound_buffer,
            },
            page_size: fc.sessions.page_size,
            default_title: fc.sessions.default_title.clone(),
        })
    }

    /// Load and validate the config rooted at `config_dir`.
    pub fn load(config_dir: &Path) -> ChatResult<Self> {
        let fc: ClientFileConfig = load_config(config_dir)
            .extract()
            .map_err(|e| ChatError::Config(e.to_string()))?;
        Self::from_file(&fc)
    }
}

fn parse_url(field: &str, raw: &str) -> ChatResult<Url> {
    Url::parse(raw).map_err(|e| ChatError::Config(format!("{field}: {e}")))
}

/// `http → ws`, `https → wss`; the host and base path are kept.
fn derive_ws_url(api_url: &Url) -> ChatResult<Url> {
    let scheme = match api_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ChatError::Config(format!(
                "cannot derive websocket url from scheme {other:?}; set server.ws_url"
            )));
        }
    };
    let mut ws_url = api_url.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot use {api_url} as websocket url")))?;
    Ok(ws_url)
}
