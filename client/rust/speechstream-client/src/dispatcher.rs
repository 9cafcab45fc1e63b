use crate::buffer::SampleBuffer;
use crate::connection::{Connection, TurnEnd, TurnHandle};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::protocol::{OutMsg, VoiceSettings, encode_out_msg, turn_messages};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Text admitted for synthesis, tagged with the generation it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utterance {
    text: String,
    try_trigger_generation: bool,
    generation: u64,
}

impl Utterance {
    pub fn new(text: impl Into<String>, try_trigger_generation: bool, generation: u64) -> Self {
        Self {
            text: text.into(),
            try_trigger_generation,
            generation,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn try_trigger_generation(&self) -> bool {
        self.try_trigger_generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What goes into every session config.
#[derive(Clone)]
pub(crate) struct SessionParams {
    pub model_id: String,
    pub voice_settings: VoiceSettings,
    pub api_key: String,
    pub try_trigger_generation: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Utterance>,
    running: bool,
}

struct Inner {
    connection: Connection,
    buffer: Arc<SampleBuffer>,
    events: EventBus,
    runtime: Handle,
    queue: Mutex<QueueState>,
    /// Held for a whole outbound sequence so utterances never interleave.
    send_lock: tokio::sync::Mutex<()>,
    /// `speak_now` tasks that have not finished yet.
    immediate: AtomicUsize,
    session: SessionParams,
    turn_timeout: Duration,
}

/// Serializes utterances onto the connection, one in flight at a time.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(
        connection: Connection,
        buffer: Arc<SampleBuffer>,
        events: EventBus,
        runtime: Handle,
        session: SessionParams,
        turn_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                buffer,
                events,
                runtime,
                queue: Mutex::new(QueueState::default()),
                send_lock: tokio::sync::Mutex::new(()),
                immediate: AtomicUsize::new(0),
                session,
                turn_timeout,
            }),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the queue and the buffer, then speaks `text` right away.
    pub fn speak_now(&self, text: impl Into<String>) -> JoinHandle<Result<()>> {
        let generation = self.interrupt();
        let utterance = Utterance::new(text, self.inner.session.try_trigger_generation, generation);

        self.inner.immediate.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let res = this.speak(utterance).await;
            this.inner.immediate.fetch_sub(1, Ordering::SeqCst);
            res
        })
    }

    /// Speaks `text` after everything already queued.
    pub fn speak_queued(&self, text: impl Into<String>) {
        let mut queue = self.lock_queue();
        let utterance = Utterance::new(
            text,
            self.inner.session.try_trigger_generation,
            self.inner.buffer.current_generation(),
        );
        tracing::debug!(
            generation = utterance.generation(),
            queued = queue.pending.len() + 1,
            "utterance queued"
        );
        queue.pending.push_back(utterance);
        if !queue.running {
            queue.running = true;
            self.inner.runtime.spawn(self.clone().run_queue());
        }
    }

    /// Drops everything queued or playing.
    pub fn stop(&self) {
        self.interrupt();
    }

    /// Forgets queued utterances but leaves buffered audio and the one in
    /// flight alone.
    pub fn stop_queue(&self) {
        let dropped = {
            let mut queue = self.lock_queue();
            std::mem::take(&mut queue.pending).len()
        };
        if dropped > 0 {
            tracing::debug!(dropped, "queue cleared");
        }
    }

    pub fn is_idle(&self) -> bool {
        let queue_idle = {
            let queue = self.lock_queue();
            queue.pending.is_empty() && !queue.running
        };
        queue_idle
            && self.inner.immediate.load(Ordering::SeqCst) == 0
            && !self.inner.connection.has_turns_in_flight()
    }

    pub fn queued(&self) -> usize {
        self.lock_queue().pending.len()
    }

    fn interrupt(&self) -> u64 {
        let (generation, dropped) = {
            let mut queue = self.lock_queue();
            let dropped = queue.pending.len();
            queue.pending.clear();
            (self.inner.buffer.interrupt(), dropped)
        };
        if self.inner.connection.has_turns_in_flight() {
            self.inner.connection.reset();
        }
        tracing::debug!(generation, dropped, "interrupted");
        self.inner
            .events
            .emit(StreamEvent::Interrupted { generation });
        generation
    }

    fn is_superseded(&self, generation: u64) -> bool {
        generation < self.inner.buffer.current_generation()
    }

    async fn run_queue(self) {
        loop {
            let next = {
                let mut queue = self.lock_queue();
                match queue.pending.pop_front() {
                    Some(utterance) => utterance,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };
            // Failures are reported inside; the next utterance gets its own attempt.
            let _ = self.speak(next).await;
        }
    }

    async fn speak(&self, utterance: Utterance) -> Result<()> {
        let generation = utterance.generation();
        let res = match self.dispatch(&utterance).await {
            Ok(Some(turn)) => self.await_turn(turn).await,
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = &res {
            if self.is_superseded(generation) {
                tracing::debug!(generation, %err, "superseded utterance failed");
            } else {
                tracing::warn!(generation, %err, "utterance failed");
                self.inner.events.emit(StreamEvent::UtteranceFailed {
                    generation,
                    reason: err.to_string(),
                });
            }
        }
        res
    }

    /// Sends the outbound sequence. Returns `None` if the utterance was
    /// interrupted before anything was sent.
    async fn dispatch(&self, utterance: &Utterance) -> Result<Option<TurnHandle>> {
        let generation = utterance.generation();
        let _send_guard = self.inner.send_lock.lock().await;
        if self.is_superseded(generation) {
            tracing::debug!(generation, "skipping superseded utterance");
            return Ok(None);
        }

        let connection = &self.inner.connection;
        connection.ready().await?;
        if self.is_superseded(generation) {
            tracing::debug!(generation, "skipping superseded utterance");
            return Ok(None);
        }

        let turn = connection.begin_turn(generation)?;
        let session_config = if connection.claim_session_config()? {
            let session = &self.inner.session;
            Some(OutMsg::session_config(
                &session.model_id,
                session.voice_settings,
                &session.api_key,
            ))
        } else {
            None
        };

        for msg in turn_messages(
            utterance.text(),
            utterance.try_trigger_generation(),
            session_config,
        ) {
            let payload = encode_out_msg(&msg)?;
            tracing::trace!(generation, kind = msg.kind(), "send");
            connection.send(payload).await?;
        }

        let chars = utterance.text().chars().count();
        tracing::debug!(generation, chars, "utterance dispatched");
        self.inner
            .events
            .emit(StreamEvent::UtteranceDispatched { generation, chars });
        Ok(Some(turn))
    }

    async fn await_turn(&self, turn: TurnHandle) -> Result<()> {
        let generation = turn.generation();
        match tokio::time::timeout(self.inner.turn_timeout, turn.wait()).await {
            Ok(TurnEnd::Final) => {
                self.inner
                    .events
                    .emit(StreamEvent::UtteranceFinished { generation });
                Ok(())
            }
            Ok(TurnEnd::Reset) => {
                tracing::debug!(generation, "utterance interrupted");
                Ok(())
            }
            Ok(TurnEnd::Closed) => Err(StreamError::Message(
                "connection closed before the final audio chunk".to_string(),
            )),
            Err(_) => {
                // The turn FIFO can no longer be trusted for this link.
                self.inner.connection.reset();
                Err(StreamError::Message(format!(
                    "no final audio chunk within {:?}",
                    self.inner.turn_timeout
                )))
            }
        }
    }
}
