use crate::buffer::SampleBuffer;
use crate::config::StreamerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::dispatcher::{Dispatcher, SessionParams};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::playback::{PlaybackBridge, PlaybackControl};
use crate::transport::{Connector, WsConnector};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[cfg(feature = "playback")]
use speechstream_core::audio::AudioOutput;

/// Front door: one connection, one sample buffer, one dispatcher.
///
/// Must be created inside a tokio runtime; background work (handshakes, the
/// inbound pump, the utterance queue) is spawned onto it.
pub struct Streamer {
    config: StreamerConfig,
    buffer: Arc<SampleBuffer>,
    connection: Connection,
    dispatcher: Dispatcher,
    control: Arc<PlaybackControl>,
    events: EventBus,
}

impl Streamer {
    pub fn new(config: StreamerConfig) -> Result<Self> {
        let connector = WsConnector::new(config.api_key.clone());
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: StreamerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| StreamError::Message(format!("a tokio runtime is required: {e}")))?;

        let api_key = match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                tracing::warn!("no API key configured, the service will likely refuse the session");
                String::new()
            }
        };

        let buffer = Arc::new(SampleBuffer::new(
            config.buffer_capacity_bytes,
            config.overflow_policy,
        ));
        let events = EventBus::new();
        let connection = Connection::new(
            config.stream_url()?,
            connector,
            config.connect_timeout(),
            buffer.clone(),
            events.clone(),
            runtime.clone(),
        );
        let dispatcher = Dispatcher::new(
            connection.clone(),
            buffer.clone(),
            events.clone(),
            runtime,
            SessionParams {
                model_id: config.model_id.clone(),
                voice_settings: config.voice_settings,
                api_key,
                try_trigger_generation: config.try_trigger_generation,
            },
            config.turn_timeout(),
        );

        tracing::debug!(?config, "streamer ready");
        Ok(Self {
            config,
            buffer,
            connection,
            dispatcher,
            control: Arc::default(),
            events,
        })
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Interrupts whatever is queued or playing and speaks `text` next.
    pub fn speak_now(&self, text: impl Into<String>) -> JoinHandle<Result<()>> {
        self.dispatcher.speak_now(text)
    }

    pub fn speak_queued(&self, text: impl Into<String>) {
        self.dispatcher.speak_queued(text)
    }

    /// Drops queued text and unplayed audio. The output device keeps running.
    pub fn stop_playback(&self) {
        self.dispatcher.stop()
    }

    pub fn pause_playback(&self) {
        self.control.pause()
    }

    pub fn resume_playback(&self) {
        self.control.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Drops queued text and closes the connection. Audio already buffered
    /// keeps playing.
    pub async fn close(&self) {
        self.dispatcher.stop_queue();
        self.connection.close().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn playback_bridge(&self) -> PlaybackBridge {
        PlaybackBridge::new(self.buffer.clone(), self.control.clone())
    }

    pub fn playback_control(&self) -> Arc<PlaybackControl> {
        self.control.clone()
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn queued(&self) -> usize {
        self.dispatcher.queued()
    }

    /// Nothing queued, nothing being synthesized.
    pub fn is_idle(&self) -> bool {
        self.dispatcher.is_idle()
    }

    /// Idle and every buffered sample has been played.
    pub fn is_drained(&self) -> bool {
        self.is_idle() && self.buffer.buffered_samples() == 0
    }

    #[cfg(feature = "playback")]
    pub fn start_output(&self, buffer_frames: Option<u32>) -> Result<AudioOutput> {
        self.playback_bridge()
            .start_output(self.config.sample_rate, buffer_frames)
    }
}
