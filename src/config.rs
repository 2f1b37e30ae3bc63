use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_MAX_SESSIONS: usize = 32;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CLOSE_POLL_MS: u64 = 5;
const DEFAULT_DECODE_ERROR_BUDGET: u32 = 0;
const DEFAULT_STREAM_URI: &str = "stub://front_camera";
const DEFAULT_TOPIC_PREFIX: &str = "camera/image";
const DEFAULT_MQTT_CLIENT_ID: &str = "stream-grabber";

/// Engine-wide limits and timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of session slots.
    pub max_sessions: usize,
    /// How long `close` waits for a worker before leaving it to drain.
    pub close_timeout: Duration,
    pub close_poll_interval: Duration,
    /// Consecutive decode failures tolerated before a session fails with
    /// `DecodeFailure`.
    pub decode_error_budget: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            close_poll_interval: Duration::from_millis(DEFAULT_CLOSE_POLL_MS),
            decode_error_budget: DEFAULT_DECODE_ERROR_BUDGET,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(anyhow!("max_sessions must be greater than zero"));
        }
        if self.close_timeout.is_zero() {
            return Err(anyhow!("close timeout must be greater than zero"));
        }
        if self.close_poll_interval.is_zero() {
            return Err(anyhow!("close poll interval must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct GrabberConfigFile {
    stream: Option<StreamConfigFile>,
    engine: Option<EngineConfigFile>,
    mqtt: Option<MqttConfigFile>,
    ffmpeg_log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    max_sessions: Option<usize>,
    close_timeout_ms: Option<u64>,
    close_poll_ms: Option<u64>,
    decode_error_budget: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    addr: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
}

/// Settings for the `stream_grabber` binary.
#[derive(Debug, Clone)]
pub struct GrabberConfig {
    pub stream: StreamSettings,
    pub engine: EngineConfig,
    pub mqtt: MqttSettings,
    pub ffmpeg_log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub uri: String,
    /// 0 selects the stream's native width.
    pub width: u32,
    /// 0 selects the stream's native height.
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// `host:port` of the broker; frames are logged instead when unset.
    pub addr: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
}

impl GrabberConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GRABBER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GrabberConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let engine = file.engine.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        Self {
            stream: StreamSettings {
                uri: stream.uri.unwrap_or_else(|| DEFAULT_STREAM_URI.to_string()),
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
            },
            engine: EngineConfig {
                max_sessions: engine.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
                close_timeout: Duration::from_millis(
                    engine.close_timeout_ms.unwrap_or(DEFAULT_CLOSE_TIMEOUT_MS),
                ),
                close_poll_interval: Duration::from_millis(
                    engine.close_poll_ms.unwrap_or(DEFAULT_CLOSE_POLL_MS),
                ),
                decode_error_budget: engine
                    .decode_error_budget
                    .unwrap_or(DEFAULT_DECODE_ERROR_BUDGET),
            },
            mqtt: MqttSettings {
                addr: mqtt.addr.filter(|addr| !addr.trim().is_empty()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            },
            ffmpeg_log_level: file.ffmpeg_log_level,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("GRABBER_STREAM_URI") {
            if !uri.trim().is_empty() {
                self.stream.uri = uri;
            }
        }
        if let Ok(max) = std::env::var("GRABBER_MAX_SESSIONS") {
            self.engine.max_sessions = max
                .parse()
                .map_err(|_| anyhow!("GRABBER_MAX_SESSIONS must be an integer"))?;
        }
        if let Ok(timeout) = std::env::var("GRABBER_CLOSE_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("GRABBER_CLOSE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.engine.close_timeout = Duration::from_millis(millis);
        }
        if let Ok(budget) = std::env::var("GRABBER_DECODE_ERROR_BUDGET") {
            self.engine.decode_error_budget = budget
                .parse()
                .map_err(|_| anyhow!("GRABBER_DECODE_ERROR_BUDGET must be an integer"))?;
        }
        if let Ok(addr) = std::env::var("GRABBER_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                self.mqtt.addr = Some(addr);
            }
        }
        if let Ok(prefix) = std::env::var("GRABBER_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.mqtt.topic_prefix = prefix;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.engine.validate()?;
        if self.stream.uri.trim().is_empty() {
            return Err(anyhow!("stream uri must not be empty"));
        }
        self.mqtt.topic_prefix = self.mqtt.topic_prefix.trim_end_matches('/').to_string();
        if self.mqtt.topic_prefix.is_empty() {
            return Err(anyhow!("topic prefix must not be empty"));
        }
        if let Some(addr) = &self.mqtt.addr {
            crate::republish::parse_broker_addr(addr)?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GrabberConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
