use anyhow::{Context, Result};
use clap::Parser;
use speechstream_client::{OverflowPolicy, StreamerConfig};
use speechstream_core::auth::ApiKeyResolver;
use std::path::PathBuf;

mod logging;
mod speak;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream synthesized speech from the ElevenLabs websocket API to the default output device"
)]
struct Cli {
    /// TOML config file; flags below override its values
    #[arg(long, short = 'c', env = "SPEECHSTREAM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ELEVENLABS_VOICE_ID")]
    voice_id: Option<String>,

    #[arg(long)]
    model_id: Option<String>,

    /// Streaming latency optimization level (0-4)
    #[arg(long)]
    latency: Option<u8>,

    /// PCM sample rate requested from the service and used for playback
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Falls back to ELEVENLABS_API_KEY, XI_API_KEY, then .env files
    #[arg(long)]
    api_key: Option<String>,

    /// Selects `.env.<name>` when looking up the API key in env files
    #[arg(long)]
    env_name: Option<String>,

    /// Sample buffer capacity in milliseconds of audio
    #[arg(long)]
    buffer_ms: Option<u32>,

    /// What to do when the sample buffer is full: drop-oldest or reject-new
    #[arg(long)]
    overflow: Option<OverflowPolicy>,

    /// Fixed device buffer size in frames
    #[arg(long)]
    buffer_frames: Option<u32>,

    /// Speak each non-empty line of this file, then exit
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    #[arg(long, default_value = "info", env = "SPEECHSTREAM_LOG")]
    log_level: String,

    /// compact, pretty, or verbose
    #[arg(long, default_value = "pretty")]
    log_style: logging::LogStyle,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn build_config(cli: &Cli) -> Result<StreamerConfig> {
    let mut config = match &cli.config {
        Some(path) => StreamerConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => StreamerConfig::default(),
    };

    if let Some(voice_id) = &cli.voice_id {
        config.voice_id = voice_id.clone();
    }
    if let Some(model_id) = &cli.model_id {
        config.model_id = model_id.clone();
    }
    if let Some(latency) = cli.latency {
        config.latency_optimization_level = latency;
    }
    if let Some(sample_rate) = cli.sample_rate {
        config.sample_rate = sample_rate;
    }
    if let Some(ms) = cli.buffer_ms {
        config = config.with_buffer_ms(ms);
    }
    if let Some(policy) = cli.overflow {
        config.overflow_policy = policy;
    }

    let explicit_key = cli.api_key.as_deref().or(config.api_key.as_deref());
    let api_key = ApiKeyResolver::new()
        .with_key(explicit_key)
        .with_env(cli.env_name.as_deref())
        .require()?;
    config.api_key = Some(api_key);

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&logging::LogConfig {
        level: cli.log_level.clone(),
        style: cli.log_style,
        json: cli.json,
    })?;

    let config = build_config(&cli)?;
    tracing::debug!(?config, "configuration resolved");

    speak::run(config, cli.input, cli.buffer_frames).await
}
