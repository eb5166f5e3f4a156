//! Runtime configuration, from a TOML file or environment variables.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::api::ws_url;
use crate::channel::{ConnectionConfig, ReconnectPolicy};
use crate::runtime::{BufferConfig, PollerConfig};

const DEFAULT_CONFIG_FILE: &str = "replyflow.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyflowConfig {
    pub base_url: String,
    pub ws_path: String,
    pub connect_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_attempts: u32,
    pub debounce_ms: u64,
    pub max_buffer_bytes: usize,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    api: ApiSection,
    #[serde(default)]
    connection: ConnectionSection,
    #[serde(default)]
    buffer: BufferSection,
    #[serde(default)]
    poller: PollerSection,
}

#[derive(Debug, Deserialize)]
struct ApiSection {
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_ws_path")]
    ws_path: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_path: default_ws_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionSection {
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    heartbeat_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    reconnect_max_attempts: u32,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BufferSection {
    #[serde(default = "default_debounce_ms")]
    debounce_ms: u64,
    #[serde(default = "default_max_buffer_bytes")]
    max_buffer_bytes: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PollerSection {
    #[serde(default = "default_poll_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_poll_max_attempts")]
    max_attempts: u32,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_max_buffer_bytes() -> usize {
    2048
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_poll_max_attempts() -> u32 {
    600
}

impl Default for ReplyflowConfig {
    fn default() -> Self {
        FileConfig::default().into()
    }
}

impl From<FileConfig> for ReplyflowConfig {
    fn from(file: FileConfig) -> Self {
        Self {
            base_url: file.api.base_url,
            ws_path: file.api.ws_path,
            connect_timeout_ms: file.connection.connect_timeout_ms,
            heartbeat_ms: file.connection.heartbeat_ms,
            reconnect_base_ms: file.connection.reconnect_base_ms,
            reconnect_max_attempts: file.connection.reconnect_max_attempts,
            debounce_ms: file.buffer.debounce_ms,
            max_buffer_bytes: file.buffer.max_buffer_bytes,
            poll_interval_ms: file.poller.interval_ms,
            poll_max_attempts: file.poller.max_attempts,
        }
    }
}

impl ReplyflowConfig {
    /// `REPLYFLOW_CONFIG` or `./replyflow.toml` when present, otherwise the
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = match env::var("REPLYFLOW_CONFIG") {
            Ok(path) => Some(path),
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Some(DEFAULT_CONFIG_FILE.to_string())
            }
            Err(_) => None,
        };

        match path {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::from_env()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("Failed to read config {}: {}", path.display(), err))?;
        let parsed: FileConfig = toml::from_str(&contents)
            .map_err(|err| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), err))?;
        Ok(parsed.into())
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> T {
            lookup(key)
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(default)
        }

        Self {
            base_url: lookup("REPLYFLOW_BASE_URL").unwrap_or_else(default_base_url),
            ws_path: lookup("REPLYFLOW_WS_PATH").unwrap_or_else(default_ws_path),
            connect_timeout_ms: parsed(
                &lookup,
                "REPLYFLOW_CONNECT_TIMEOUT_MS",
                default_connect_timeout_ms(),
            ),
            heartbeat_ms: parsed(&lookup, "REPLYFLOW_HEARTBEAT_MS", default_heartbeat_ms()),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            debounce_ms: parsed(&lookup, "REPLYFLOW_DEBOUNCE_MS", default_debounce_ms()),
            max_buffer_bytes: parsed(
                &lookup,
                "REPLYFLOW_MAX_BUFFER_BYTES",
                default_max_buffer_bytes(),
            ),
            poll_interval_ms: parsed(
                &lookup,
                "REPLYFLOW_POLL_INTERVAL_MS",
                default_poll_interval_ms(),
            ),
            poll_max_attempts: parsed(
                &lookup,
                "REPLYFLOW_POLL_MAX_ATTEMPTS",
                default_poll_max_attempts(),
            ),
        }
    }

    pub fn ws_url(&self) -> String {
        ws_url(&self.base_url, &self.ws_path)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.ws_url(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(self.reconnect_base_ms),
                self.reconnect_max_attempts,
            ),
        }
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.poll_max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReplyflowConfig::default();
        assert_eq!(config.ws_url(), "ws://127.0.0.1:8000/ws");
        assert_eq!(config.buffer_config(), BufferConfig::default());
        assert_eq!(config.poller_config(), PollerConfig::default());
        assert_eq!(
            config.connection_config().connect_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[api]
base_url = "https://chat.example.com"

[buffer]
debounce_ms = 20

[poller]
max_attempts = 30
"#
        )
        .unwrap();

        let config = ReplyflowConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ws_url(), "wss://chat.example.com/ws");
        assert_eq!(config.debounce_ms, 20);
        assert_eq!(config.max_buffer_bytes, 2048);
        assert_eq!(config.poll_max_attempts, 30);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.reconnect_max_attempts, 5);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[buffer]\ndebounce_ms = \"fast\"").unwrap();
        let error = ReplyflowConfig::from_file(file.path()).unwrap_err();
        assert!(error.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_environment_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REPLYFLOW_BASE_URL", "http://backend:9000"),
            ("REPLYFLOW_DEBOUNCE_MS", "75"),
            ("REPLYFLOW_POLL_INTERVAL_MS", "not-a-number"),
        ]);
        let config =
            ReplyflowConfig::from_lookup(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.ws_url(), "ws://backend:9000/ws");
        assert_eq!(config.debounce_ms, 75);
        assert_eq!(config.poll_interval_ms, 1_000);
    }
}
