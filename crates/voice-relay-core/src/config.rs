//! Configuration loading and validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Voice Relay configuration.
///
/// Every section is optional; missing sections fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc: Option<WebRtcConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Concurrent browser sessions. When full, a new offer evicts the oldest.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Serve the embedded test page at `/`.
    #[serde(default = "default_true")]
    pub ui: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            max_sessions: default_max_sessions(),
            ui: true,
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_max_sessions() -> usize {
    1
}

fn default_true() -> bool {
    true
}

// --- WebRTC ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// How long to wait for ICE gathering before answering with what we have.
    #[serde(default = "default_gathering_timeout_ms")]
    pub gathering_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            gathering_timeout_ms: default_gathering_timeout_ms(),
        }
    }
}

impl WebRtcConfig {
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".into()]
}

fn default_gathering_timeout_ms() -> u64 {
    5_000
}

// --- Media ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate: i32,

    #[serde(default = "default_payload_type")]
    pub payload_type: u8,

    /// Fixed outbound SSRC. Random per session when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,

    /// Inbound track is considered dead after this long without a packet.
    #[serde(default = "default_track_idle_timeout_ms")]
    pub track_idle_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            opus_bitrate: default_opus_bitrate(),
            payload_type: default_payload_type(),
            ssrc: None,
            track_idle_timeout_ms: default_track_idle_timeout_ms(),
        }
    }
}

impl MediaConfig {
    pub fn track_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.track_idle_timeout_ms)
    }
}

fn default_opus_bitrate() -> i32 {
    64_000
}

fn default_payload_type() -> u8 {
    111
}

fn default_track_idle_timeout_ms() -> u64 {
    30_000
}

// --- Upstream ---

/// Which cloud speech endpoint sessions are bridged to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Gemini Live bidirectional audio (duplex).
    #[default]
    Gemini,
    /// OpenAI Realtime over WebSocket (duplex).
    Openai,
    /// Whisper-style HTTP transcription (batch, inbound only).
    Whisper,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Openai => "openai",
            Self::Whisper => "whisper",
        }
    }

    pub fn is_duplex(self) -> bool {
        !matches!(self, Self::Whisper)
    }

    /// Environment variable consulted when no key is configured.
    pub fn default_api_key_env(self) -> Option<&'static str> {
        match self {
            Self::Gemini => Some("GOOGLE_API_KEY"),
            Self::Openai => Some("OPENAI_API_KEY"),
            Self::Whisper => None,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => "gemini-live-2.5-flash-preview",
            Self::Openai => "gpt-4o-mini-realtime-preview",
            Self::Whisper => "whisper-1",
        }
    }

    /// Sample rate the endpoint expects for inbound audio.
    pub fn default_input_rate(self) -> u32 {
        match self {
            Self::Gemini => 16_000,
            Self::Openai => 24_000,
            Self::Whisper => 16_000,
        }
    }

    /// Batch duration forwarded per upstream send.
    pub fn default_batch_ms(self) -> u32 {
        match self {
            Self::Gemini | Self::Openai => 500,
            Self::Whisper => 3_000,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openai" => Ok(Self::Openai),
            "whisper" => Ok(Self::Whisper),
            other => Err(format!("unknown provider '{other}' (expected gemini, openai, or whisper)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Endpoint override (WebSocket URL for duplex providers, HTTP URL for whisper).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_ms: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_rate: Option<u32>,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Close the upstream link after this long without a message. Unset means no deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_response_format")]
    pub response_format: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            api_key: None,
            api_key_env: None,
            model: None,
            base_url: None,
            voice: None,
            instructions: None,
            batch_ms: None,
            input_rate: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            idle_timeout_ms: None,
            request_timeout_ms: default_request_timeout_ms(),
            temperature: default_temperature(),
            response_format: default_response_format(),
        }
    }
}

impl UpstreamConfig {
    /// Resolve the API key: `api_key` first, then `api_key_env`, then the provider's default variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let env = self
            .api_key_env
            .clone()
            .or_else(|| self.provider.default_api_key_env().map(String::from));
        resolve_secret_field(&self.api_key, &env)
    }

    /// Name of the variable the key is expected in, for error messages.
    pub fn api_key_source(&self) -> String {
        self.api_key_env
            .clone()
            .or_else(|| self.provider.default_api_key_env().map(String::from))
            .unwrap_or_else(|| "upstream.api_key".into())
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
            .unwrap_or_else(|| self.provider.default_input_rate())
    }

    pub fn batch_ms(&self) -> u32 {
        self.batch_ms
            .unwrap_or_else(|| self.provider.default_batch_ms())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_response_format() -> String {
    "json".into()
}

// --- Logging ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voice_relay_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::RelayError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(3000)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn max_sessions(&self) -> usize {
        self.gateway.as_ref().map(|g| g.max_sessions).unwrap_or(1)
    }

    pub fn ui_enabled(&self) -> bool {
        self.gateway.as_ref().map(|g| g.ui).unwrap_or(true)
    }

    pub fn webrtc(&self) -> WebRtcConfig {
        self.webrtc.clone().unwrap_or_default()
    }

    pub fn media(&self) -> MediaConfig {
        self.media.clone().unwrap_or_default()
    }

    pub fn upstream(&self) -> UpstreamConfig {
        self.upstream.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "upstream.provider").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.max_sessions == 0 {
                errors.push("gateway.max_sessions must be at least 1".to_string());
            }
        }

        let upstream = self.upstream();
        if upstream.resolve_api_key().is_none() {
            if upstream.provider.is_duplex() {
                errors.push(format!(
                    "Provider '{}' has no API key configured (set {})",
                    upstream.provider,
                    upstream.api_key_source()
                ));
            } else {
                warnings.push(format!(
                    "Provider '{}' has no API key configured; requests are sent unauthenticated",
                    upstream.provider
                ));
            }
        }

        let rate = upstream.input_rate();
        if rate == 0 || 48_000 % rate != 0 {
            errors.push(format!(
                "upstream.input_rate {rate} must divide 48000 evenly"
            ));
        }
        if upstream.batch_ms() == 0 {
            errors.push("upstream.batch_ms must be positive".to_string());
        }

        let media = self.media();
        if !(96..=127).contains(&media.payload_type) {
            warnings.push(format!(
                "media.payload_type {} is outside the dynamic range 96-127",
                media.payload_type
            ));
        }

        if self.webrtc().ice_servers.is_empty() {
            warnings.push("No ICE servers configured; only host candidates will be offered".into());
        }

        (warnings, errors)
    }
}

/// Base directory for Voice Relay data: `~/.voice_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voice_relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_VR_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_VR_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VR_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VR_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 3000);
        assert_eq!(config.max_sessions(), 1);
        assert_eq!(config.bind_addr(), "0.0.0.0");
        assert_eq!(config.media().payload_type, 111);
        assert_eq!(config.media().opus_bitrate, 64_000);
        assert_eq!(config.upstream().provider, ProviderKind::Gemini);
        assert_eq!(
            config.webrtc().ice_servers,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[test]
    fn test_provider_defaults() {
        assert_eq!(ProviderKind::Gemini.default_input_rate(), 16_000);
        assert_eq!(ProviderKind::Openai.default_input_rate(), 24_000);
        assert_eq!(ProviderKind::Whisper.default_batch_ms(), 3_000);
        assert!(ProviderKind::Openai.is_duplex());
        assert!(!ProviderKind::Whisper.is_duplex());
        assert_eq!("google".parse::<ProviderKind>(), Ok(ProviderKind::Gemini));
        assert!("azure".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_upstream_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_VR_API_KEY", "from-env") };
        let upstream = UpstreamConfig {
            api_key_env: Some("TEST_VR_API_KEY".into()),
            ..UpstreamConfig::default()
        };
        assert_eq!(upstream.resolve_api_key(), Some("from-env".into()));

        let direct = UpstreamConfig {
            api_key_env: Some("TEST_VR_API_KEY".into()),
            api_key: Some("direct-key".into()),
            ..UpstreamConfig::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_VR_API_KEY") };
    }

    #[test]
    fn test_upstream_json5_deser() {
        let json_str = r#"{
            upstream: {
                provider: "openai",
                voice: "marin",
                batch_ms: 250,
            },
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let upstream = config.upstream();
        assert_eq!(upstream.provider, ProviderKind::Openai);
        assert_eq!(upstream.voice.as_deref(), Some("marin"));
        assert_eq!(upstream.batch_ms(), 250);
        assert_eq!(upstream.input_rate(), 24_000);
        assert_eq!(upstream.model(), "gpt-4o-mini-realtime-preview");
        assert_eq!(upstream.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_load_missing_file_yields_default() {
        let config = Config::load(Path::new("/nonexistent/voice-relay/config.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ gateway: { port: 4100, max_sessions: 4 }, media: { ssrc: 1234 } }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 4100);
        assert_eq!(config.max_sessions(), 4);
        assert_eq!(config.media().ssrc, Some(1234));
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(4100)));
    }

    #[test]
    fn test_validate_missing_duplex_key_errors() {
        let config = Config {
            upstream: Some(UpstreamConfig {
                api_key_env: Some("NONEXISTENT_VR_KEY".into()),
                ..UpstreamConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("gemini") && e.contains("API key")),
            "Expected an error about the missing key, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_whisper_without_key_only_warns() {
        let config = Config {
            upstream: Some(UpstreamConfig {
                provider: ProviderKind::Whisper,
                ..UpstreamConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(warnings.iter().any(|w| w.contains("whisper")));
    }

    #[test]
    fn test_validate_bad_rate_and_sessions() {
        let config = Config {
            gateway: Some(GatewayConfig {
                max_sessions: 0,
                ..GatewayConfig::default()
            }),
            upstream: Some(UpstreamConfig {
                provider: ProviderKind::Whisper,
                input_rate: Some(44_100),
                ..UpstreamConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("max_sessions")));
        assert!(errors.iter().any(|e| e.contains("44100")));
    }
}
