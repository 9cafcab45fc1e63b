use crate::connection::ConnectionState;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable things that happen inside a [`crate::Streamer`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ConnectFailed {
        reason: String,
    },
    /// An inbound message could not be decoded; the connection stays open.
    DecodeError {
        message: String,
    },
    ServerError {
        message: String,
    },
    /// Audio arrived faster than it was played and the overflow policy kicked in.
    BufferSaturated {
        dropped_bytes: usize,
        rejected: bool,
    },
    StaleAudioDiscarded {
        generation: u64,
        bytes: usize,
    },
    UtteranceDispatched {
        generation: u64,
        chars: usize,
    },
    UtteranceFinished {
        generation: u64,
    },
    UtteranceFailed {
        generation: u64,
        reason: String,
    },
    Interrupted {
        generation: u64,
    },
}

#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        tracing::trace!(?event, "stream event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}
