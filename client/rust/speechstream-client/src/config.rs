use crate::buffer::{BYTES_PER_SAMPLE, OverflowPolicy};
use crate::error::{Result, StreamError};
use crate::protocol::VoiceSettings;
use serde::{Deserialize, Serialize};
use speechstream_core::audio::{DEFAULT_SAMPLE_RATE, pcm16_bytes_for_ms};
use speechstream_core::ws::build_ws_url;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "wss://api.elevenlabs.io";
pub const DEFAULT_MODEL_ID: &str = "eleven_multilingual_v2";
pub const DEFAULT_LATENCY_LEVEL: u8 = 3;
pub const MAX_LATENCY_LEVEL: u8 = 4;

/// PCM rates the service can stream as `pcm_<rate>`.
pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[8_000, 16_000, 22_050, 24_000, 44_100, 48_000];

const DEFAULT_BUFFER_SECONDS: u32 = 30;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
    pub latency_optimization_level: u8,
    pub sample_rate: u32,
    /// Resolved at startup when absent; never written back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub buffer_capacity_bytes: usize,
    pub overflow_policy: OverflowPolicy,
    pub voice_settings: VoiceSettings,
    pub try_trigger_generation: bool,
    pub connect_timeout_ms: u64,
    pub turn_timeout_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            voice_id: String::new(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            latency_optimization_level: DEFAULT_LATENCY_LEVEL,
            sample_rate: DEFAULT_SAMPLE_RATE,
            api_key: None,
            buffer_capacity_bytes: pcm16_bytes_for_ms(
                DEFAULT_SAMPLE_RATE,
                DEFAULT_BUFFER_SECONDS * 1000,
            ),
            overflow_policy: OverflowPolicy::default(),
            voice_settings: VoiceSettings::default(),
            try_trigger_generation: true,
            connect_timeout_ms: 10_000,
            turn_timeout_ms: 30_000,
        }
    }
}

impl std::fmt::Debug for StreamerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamerConfig")
            .field("base_url", &self.base_url)
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .field("latency_optimization_level", &self.latency_optimization_level)
            .field("sample_rate", &self.sample_rate)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("buffer_capacity_bytes", &self.buffer_capacity_bytes)
            .field("overflow_policy", &self.overflow_policy)
            .field("voice_settings", &self.voice_settings)
            .field("try_trigger_generation", &self.try_trigger_generation)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("turn_timeout_ms", &self.turn_timeout_ms)
            .finish()
    }
}

impl StreamerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|e| StreamError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| StreamError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.voice_id.trim().is_empty() {
            return Err(StreamError::Config("voice_id is required".to_string()));
        }
        if self.model_id.trim().is_empty() {
            return Err(StreamError::Config("model_id must not be empty".to_string()));
        }
        if self.latency_optimization_level > MAX_LATENCY_LEVEL {
            return Err(StreamError::Config(format!(
                "latency_optimization_level must be 0..={MAX_LATENCY_LEVEL}, got {}",
                self.latency_optimization_level
            )));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(StreamError::Config(format!(
                "sample_rate {} is not one of {SUPPORTED_SAMPLE_RATES:?}",
                self.sample_rate
            )));
        }
        if self.buffer_capacity_bytes < BYTES_PER_SAMPLE {
            return Err(StreamError::Config(format!(
                "buffer_capacity_bytes must hold at least one sample ({BYTES_PER_SAMPLE} bytes)"
            )));
        }
        for (name, value) in [
            ("stability", self.voice_settings.stability),
            ("similarity_boost", self.voice_settings.similarity_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(StreamError::Config(format!(
                    "voice_settings.{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        if self.connect_timeout_ms == 0 || self.turn_timeout_ms == 0 {
            return Err(StreamError::Config(
                "connect_timeout_ms and turn_timeout_ms must be non-zero".to_string(),
            ));
        }
        self.stream_url().map(|_| ())
    }

    /// Sets the buffer capacity from a duration at the configured sample rate.
    pub fn with_buffer_ms(mut self, ms: u32) -> Self {
        self.buffer_capacity_bytes = pcm16_bytes_for_ms(self.sample_rate, ms);
        self
    }

    pub fn output_format(&self) -> String {
        format!("pcm_{}", self.sample_rate)
    }

    pub fn stream_url(&self) -> Result<Url> {
        let path = format!("v1/text-to-speech/{}/stream-input", self.voice_id.trim());
        let latency = self.latency_optimization_level.to_string();
        let output_format = self.output_format();
        build_ws_url(
            &self.base_url,
            &path,
            &[
                ("model_id", self.model_id.as_str()),
                ("optimize_streaming_latency", latency.as_str()),
                ("output_format", output_format.as_str()),
            ],
        )
        .map_err(|e| StreamError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_voice() -> StreamerConfig {
        StreamerConfig {
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            ..StreamerConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_voice_is_set() {
        assert!(StreamerConfig::default().validate().is_err());
        let config = with_voice();
        config.validate().unwrap();
        assert_eq!(config.buffer_capacity_bytes, 2_646_000);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn builds_stream_url() {
        let url = with_voice().stream_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.elevenlabs.io/v1/text-to-speech/21m00Tcm4TlvDq8ikWAM/stream-input\
             ?model_id=eleven_multilingual_v2&optimize_streaming_latency=3&output_format=pcm_44100"
        );
    }

    #[test]
    fn parses_partial_toml() {
        let config = StreamerConfig::from_toml(
            r#"
            voice_id = "abc"
            sample_rate = 24000
            overflow_policy = "reject_new"

            [voice_settings]
            stability = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(config.voice_id, "abc");
        assert_eq!(config.sample_rate, 24_000);
        assert_eq!(config.overflow_policy, OverflowPolicy::RejectNew);
        assert_eq!(config.voice_settings.stability, 0.3);
        assert_eq!(config.voice_settings.similarity_boost, 0.8);
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            StreamerConfig {
                latency_optimization_level: 5,
                ..with_voice()
            },
            StreamerConfig {
                sample_rate: 11_025,
                ..with_voice()
            },
            StreamerConfig {
                buffer_capacity_bytes: 1,
                ..with_voice()
            },
            StreamerConfig {
                base_url: "https://api.elevenlabs.io".to_string(),
                ..with_voice()
            },
            StreamerConfig {
                voice_settings: VoiceSettings {
                    stability: 1.5,
                    similarity_boost: 0.8,
                },
                ..with_voice()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(StreamError::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn buffer_ms_uses_sample_rate() {
        let config = StreamerConfig {
            sample_rate: 16_000,
            ..with_voice()
        }
        .with_buffer_ms(500);
        assert_eq!(config.buffer_capacity_bytes, 16_000);
        assert_eq!(
            speechstream_core::audio::pcm16_ms_for_bytes(
                config.sample_rate,
                config.buffer_capacity_bytes
            ),
            500
        );
    }

    #[test]
    fn api_key_is_not_serialized_or_logged() {
        let config = StreamerConfig {
            api_key: Some("secret-key".to_string()),
            ..with_voice()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret-key"));
        assert!(!format!("{config:?}").contains("secret-key"));
    }
}
