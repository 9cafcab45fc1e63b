mod error;

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod streamer;
pub mod transport;

pub use buffer::{AppendOutcome, BufferStats, OverflowPolicy, SampleBuffer};
pub use config::StreamerConfig;
pub use connection::{Connection, ConnectionState, Readiness, TurnEnd, TurnHandle};
pub use dispatcher::{Dispatcher, Utterance};
pub use error::{Result, StreamError};
pub use events::StreamEvent;
pub use playback::{PlaybackBridge, PlaybackControl};
pub use protocol::{AudioChunk, OutMsg, VoiceSettings};
pub use streamer::Streamer;
pub use transport::{Connector, Link, LinkEvent, Outbound, WsConnector};
