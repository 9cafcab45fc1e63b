//! Connection lifecycle and the inbound audio pump.
//!
//! A [`Connection`] owns at most one live [`Link`]. Every connect attempt gets
//! its own readiness future; callers that ask while a handshake is running
//! share it instead of starting another one. Events from a link or attempt
//! that has since been replaced are dropped.
//!
//! Turns are tracked in send order per link. Audio is tagged with the
//! generation of the oldest open turn, so chunks still arriving for an
//! interrupted utterance are discarded by the sample buffer.

use crate::buffer::{AppendOutcome, SampleBuffer};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::protocol::{AudioChunk, decode_in_frame, decode_in_msg};
use crate::transport::{Connector, Link, LinkEvent, Outbound};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use speechstream_core::ws::redact_ws_url;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves `true` once the attempt it belongs to is open, `false` otherwise.
pub type Readiness = Shared<BoxFuture<'static, bool>>;

/// How a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnEnd {
    /// The server sent `isFinal`.
    Final,
    /// The link went away first.
    Closed,
    /// The connection was reset to drop an interrupted utterance.
    Reset,
}

/// Waits for the end of one dispatched utterance.
#[derive(Debug)]
pub struct TurnHandle {
    generation: u64,
    done: oneshot::Receiver<TurnEnd>,
}

impl TurnHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn wait(self) -> TurnEnd {
        self.done.await.unwrap_or(TurnEnd::Reset)
    }
}

struct Turn {
    generation: u64,
    done: oneshot::Sender<TurnEnd>,
}

struct LinkSlot {
    id: u64,
    outbound: mpsc::Sender<Outbound>,
    configured: bool,
    turns: VecDeque<Turn>,
}

impl LinkSlot {
    fn end_turns(self, end: TurnEnd) {
        for turn in self.turns {
            let _ = turn.done.send(end);
        }
    }
}

struct Pending {
    readiness: Readiness,
    resolve: oneshot::Sender<bool>,
}

#[derive(Clone, Debug)]
enum Failure {
    Timeout(Duration),
    Other(String),
}

#[derive(Default)]
struct Slot {
    state: ConnectionState,
    attempt: u64,
    pending: Option<Pending>,
    link: Option<LinkSlot>,
    last_failure: Option<Failure>,
}

impl Slot {
    fn current_link(&mut self, link_id: u64) -> Option<&mut LinkSlot> {
        self.link.as_mut().filter(|link| link.id == link_id)
    }
}

struct Inner {
    url: Url,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    buffer: Arc<SampleBuffer>,
    events: EventBus,
    runtime: Handle,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(
        url: Url,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        buffer: Arc<SampleBuffer>,
        events: EventBus,
        runtime: Handle,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url,
                connector,
                connect_timeout,
                buffer,
                events,
                runtime,
                slot: Mutex::new(Slot::default()),
                state_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, slot: &mut Slot, to: ConnectionState) {
        let from = slot.state;
        if from == to {
            return;
        }
        slot.state = to;
        self.inner.state_tx.send_replace(to);
        tracing::debug!(%from, %to, attempt = slot.attempt, "connection state");
        self.inner.events.emit(StreamEvent::StateChanged { from, to });
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Starts a handshake unless one is running or the link is already open.
    pub fn connect(&self) -> Readiness {
        let mut slot = self.lock();
        match slot.state {
            ConnectionState::Open => return futures_util::future::ready(true).boxed().shared(),
            ConnectionState::Connecting => {
                if let Some(pending) = &slot.pending {
                    return pending.readiness.clone();
                }
            }
            _ => {}
        }

        slot.attempt += 1;
        let attempt = slot.attempt;
        let (resolve, rx) = oneshot::channel::<bool>();
        let readiness: Readiness = async move { rx.await.unwrap_or(false) }.boxed().shared();
        slot.pending = Some(Pending {
            readiness: readiness.clone(),
            resolve,
        });
        slot.last_failure = None;
        self.set_state(&mut slot, ConnectionState::Connecting);
        drop(slot);

        tracing::info!(attempt, url = %redact_ws_url(&self.inner.url), "connecting");
        self.inner.runtime.spawn(self.clone().handshake(attempt));
        readiness
    }

    /// Waits until the connection is open, connecting first if needed.
    pub async fn ready(&self) -> Result<()> {
        if self.connect().await {
            return Ok(());
        }
        let failure = self.lock().last_failure.clone();
        Err(match failure {
            Some(Failure::Timeout(after)) => StreamError::ConnectTimeout(after),
            Some(Failure::Other(reason)) => StreamError::ConnectFailure(reason),
            None => StreamError::ConnectFailure("connection closed before it opened".to_string()),
        })
    }

    async fn handshake(self, attempt: u64) {
        let connect_timeout = self.inner.connect_timeout;
        let connecting = self.inner.connector.connect(self.inner.url.clone());
        let result = match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::ConnectTimeout(connect_timeout)),
        };

        let mut slot = self.lock();
        let pending = match slot.pending.take() {
            Some(pending) if slot.attempt == attempt => pending,
            other => {
                slot.pending = other;
                drop(slot);
                tracing::debug!(attempt, "handshake finished for an abandoned attempt");
                if let Ok(link) = result {
                    let _ = link.outbound.try_send(Outbound::Close);
                }
                return;
            }
        };

        match result {
            Ok(Link { outbound, events }) => {
                if let Some(previous) = slot.link.take() {
                    previous.end_turns(TurnEnd::Closed);
                }
                slot.link = Some(LinkSlot {
                    id: attempt,
                    outbound,
                    configured: false,
                    turns: VecDeque::new(),
                });
                self.set_state(&mut slot, ConnectionState::Open);
                drop(slot);
                self.inner.runtime.spawn(self.clone().pump(attempt, events));
                let _ = pending.resolve.send(true);
            }
            Err(err) => {
                let reason = err.to_string();
                slot.last_failure = Some(match err {
                    StreamError::ConnectTimeout(after) => Failure::Timeout(after),
                    StreamError::ConnectFailure(detail) => Failure::Other(detail),
                    _ => Failure::Other(reason.clone()),
                });
                self.set_state(&mut slot, ConnectionState::Failed);
                drop(slot);
                tracing::warn!(attempt, %reason, "connect failed");
                self.inner
                    .events
                    .emit(StreamEvent::ConnectFailed { reason });
                let _ = pending.resolve.send(false);
            }
        }
    }

    /// Writes one text frame. Fails with [`StreamError::NotConnected`] unless open.
    pub async fn send(&self, payload: String) -> Result<()> {
        let outbound = {
            let slot = self.lock();
            match (&slot.state, &slot.link) {
                (ConnectionState::Open, Some(link)) => link.outbound.clone(),
                _ => return Err(StreamError::NotConnected),
            }
        };
        let (written, ack) = oneshot::channel();
        outbound
            .send(Outbound::Text { payload, written })
            .await
            .map_err(|_| StreamError::NotConnected)?;
        ack.await.map_err(|_| StreamError::NotConnected)?
    }

    /// Registers a dispatched utterance on the open link.
    pub fn begin_turn(&self, generation: u64) -> Result<TurnHandle> {
        let mut slot = self.lock();
        if slot.state != ConnectionState::Open {
            return Err(StreamError::NotConnected);
        }
        let link = slot.link.as_mut().ok_or(StreamError::NotConnected)?;
        let (done, rx) = oneshot::channel();
        link.turns.push_back(Turn { generation, done });
        Ok(TurnHandle {
            generation,
            done: rx,
        })
    }

    /// Returns `true` exactly once per link: the caller must send the session
    /// config before anything else on it.
    pub fn claim_session_config(&self) -> Result<bool> {
        let mut slot = self.lock();
        if slot.state != ConnectionState::Open {
            return Err(StreamError::NotConnected);
        }
        let link = slot.link.as_mut().ok_or(StreamError::NotConnected)?;
        Ok(!std::mem::replace(&mut link.configured, true))
    }

    pub fn has_turns_in_flight(&self) -> bool {
        self.lock()
            .link
            .as_ref()
            .is_some_and(|link| !link.turns.is_empty())
    }

    /// Abandons a running handshake. Returns `false` if nothing was pending.
    fn abandon_attempt(&self, slot: &mut Slot) -> bool {
        let Some(pending) = slot.pending.take() else {
            return false;
        };
        // Bump so the handshake result is recognised as stale.
        slot.attempt += 1;
        let _ = pending.resolve.send(false);
        self.set_state(slot, ConnectionState::Closed);
        true
    }

    /// Drops the current link without a closing handshake and ends its turns.
    pub fn reset(&self) {
        let mut slot = self.lock();
        if self.abandon_attempt(&mut slot) {
            return;
        }
        let Some(link) = slot.link.take() else {
            return;
        };
        tracing::debug!(link = link.id, turns = link.turns.len(), "resetting connection");
        let _ = link.outbound.try_send(Outbound::Close);
        link.end_turns(TurnEnd::Reset);
        self.set_state(&mut slot, ConnectionState::Closed);
    }

    /// Graceful close. Safe to call in any state.
    pub async fn close(&self) {
        let outbound = {
            let mut slot = self.lock();
            match slot.state {
                ConnectionState::Connecting => {
                    self.abandon_attempt(&mut slot);
                    return;
                }
                ConnectionState::Open => {}
                _ => return,
            }
            let Some(link) = slot.link.as_ref() else {
                self.set_state(&mut slot, ConnectionState::Closed);
                return;
            };
            let outbound = link.outbound.clone();
            self.set_state(&mut slot, ConnectionState::Closing);
            outbound
        };

        let mut state_rx = self.subscribe_state();
        let _ = outbound.send(Outbound::Close).await;
        let settled = tokio::time::timeout(
            CLOSE_ACK_TIMEOUT,
            state_rx.wait_for(|state| *state != ConnectionState::Closing),
        )
        .await
        .map(|res| res.map(|state| *state));

        match settled {
            Ok(Ok(ConnectionState::Closed)) => tracing::info!("connection closed"),
            Ok(Ok(state)) => {
                // A new attempt started while closing; the old link goes down on its own.
                tracing::debug!(%state, "close superseded");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                tracing::warn!(timeout = ?CLOSE_ACK_TIMEOUT, "close not acknowledged, dropping link");
                let mut slot = self.lock();
                if slot.state == ConnectionState::Closing {
                    if let Some(link) = slot.link.take() {
                        link.end_turns(TurnEnd::Closed);
                    }
                    self.set_state(&mut slot, ConnectionState::Closed);
                }
            }
        }
    }

    async fn pump(self, link_id: u64, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(link_id) {
                tracing::debug!(link = link_id, "ignoring event from replaced link");
                return;
            }
            match event {
                LinkEvent::Message(text) => self.on_message(link_id, decode_in_msg(&text)),
                LinkEvent::Binary(bytes) => self.on_message(link_id, decode_in_frame(&bytes)),
                LinkEvent::Closed { code, reason } => {
                    self.on_link_down(
                        link_id,
                        ConnectionState::Closed,
                        format!("closed by peer (code {code}) {reason}"),
                    );
                    return;
                }
                LinkEvent::Error(reason) => {
                    self.on_link_down(link_id, ConnectionState::Failed, reason);
                    return;
                }
            }
        }
        self.on_link_down(
            link_id,
            ConnectionState::Closed,
            "link dropped".to_string(),
        );
    }

    fn is_current(&self, link_id: u64) -> bool {
        self.lock().current_link(link_id).is_some()
    }

    fn on_message(&self, link_id: u64, decoded: Result<AudioChunk>) {
        let chunk = match decoded {
            Ok(chunk) => chunk,
            Err(StreamError::Server(message)) => {
                tracing::warn!(%message, "server reported an error");
                self.inner
                    .events
                    .emit(StreamEvent::ServerError { message });
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "dropping undecodable message");
                self.inner.events.emit(StreamEvent::DecodeError {
                    message: err.to_string(),
                });
                return;
            }
        };

        let generation = {
            let mut slot = self.lock();
            let Some(link) = slot.current_link(link_id) else {
                return;
            };
            match link.turns.front() {
                Some(turn) => turn.generation,
                None => self.inner.buffer.current_generation(),
            }
        };

        if !chunk.pcm.is_empty() {
            self.append_audio(generation, &chunk.pcm);
        }

        if chunk.is_final {
            let turn = self
                .lock()
                .current_link(link_id)
                .and_then(|link| link.turns.pop_front());
            if let Some(turn) = turn {
                tracing::debug!(generation = turn.generation, "turn complete");
                let _ = turn.done.send(TurnEnd::Final);
            }
        }
    }

    fn append_audio(&self, generation: u64, pcm: &[u8]) {
        let events = &self.inner.events;
        match self.inner.buffer.append(generation, pcm) {
            Ok(AppendOutcome::Accepted) => {
                tracing::trace!(generation, bytes = pcm.len(), "audio buffered");
            }
            Ok(AppendOutcome::Stale) => {
                tracing::debug!(generation, bytes = pcm.len(), "discarding stale audio");
                events.emit(StreamEvent::StaleAudioDiscarded {
                    generation,
                    bytes: pcm.len(),
                });
            }
            Ok(AppendOutcome::Overflowed { dropped_bytes }) => {
                tracing::warn!(dropped_bytes, "sample buffer full, dropped oldest audio");
                events.emit(StreamEvent::BufferSaturated {
                    dropped_bytes,
                    rejected: false,
                });
            }
            Err(StreamError::BufferSaturated { requested, free }) => {
                tracing::warn!(requested, free, "sample buffer full, rejected audio");
                events.emit(StreamEvent::BufferSaturated {
                    dropped_bytes: requested,
                    rejected: true,
                });
            }
            Err(err) => tracing::warn!(%err, "failed to buffer audio"),
        }
    }

    fn on_link_down(&self, link_id: u64, state: ConnectionState, reason: String) {
        let mut slot = self.lock();
        if slot.current_link(link_id).is_none() {
            return;
        }
        let Some(link) = slot.link.take() else {
            return;
        };
        if slot.pending.is_some() {
            // The state belongs to the attempt now in progress.
            tracing::debug!(link = link_id, %reason, "previous link went down during a new attempt");
            link.end_turns(TurnEnd::Closed);
            return;
        }
        let target = if slot.state == ConnectionState::Closing {
            ConnectionState::Closed
        } else {
            state
        };
        if target == ConnectionState::Failed {
            tracing::warn!(link = link_id, %reason, "connection failed");
            slot.last_failure = Some(Failure::Other(reason));
        } else {
            tracing::info!(link = link_id, %reason, "connection closed");
        }
        link.end_turns(TurnEnd::Closed);
        self.set_state(&mut slot, target);
    }
}
