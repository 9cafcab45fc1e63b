//! The seam between the session logic and the wire.
//!
//! A [`Connector`] opens a [`Link`]: a command channel towards the transport
//! and an event channel back from it. [`WsConnector`] backs a link with a
//! websocket; tests plug in an in-process connector.

use crate::error::{Result, StreamError};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use speechstream_core::ws::{WsStream, connect_ws, redact_ws_url};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const LINK_CHANNEL_CAPACITY: usize = 128;
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

#[derive(Debug)]
pub enum Outbound {
    /// One text frame; `written` resolves once the frame is flushed.
    Text {
        payload: String,
        written: oneshot::Sender<Result<()>>,
    },
    /// Start the closing handshake. The link reports [`LinkEvent::Closed`]
    /// once the peer acknowledges.
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Message(String),
    Binary(Vec<u8>),
    Closed { code: u16, reason: String },
    Error(String),
}

#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Outbound>,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl Link {
    /// Creates both ends of a link. The second value is what a transport
    /// drives: it receives commands and publishes events.
    pub fn pair() -> (Self, mpsc::Receiver<Outbound>, mpsc::Sender<LinkEvent>) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (ev_tx, ev_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (
            Self {
                outbound: out_tx,
                events: ev_rx,
            },
            out_rx,
            ev_tx,
        )
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Link>>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Clone, Default)]
pub struct WsConnector {
    api_key: Option<String>,
}

impl WsConnector {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Link>> {
        let api_key = self.api_key.clone();
        async move {
            let stream = connect_ws(&url, api_key.as_deref())
                .await
                .map_err(|e| StreamError::ConnectFailure(format!("{e:#}")))?;
            tracing::info!(url = %redact_ws_url(&url), "websocket connected");

            let (link, commands, events) = Link::pair();
            tokio::spawn(run_ws_link(stream, commands, events));
            Ok(link)
        }
        .boxed()
    }
}

async fn run_ws_link(
    stream: WsStream,
    mut commands: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<LinkEvent>,
) {
    let (mut ws_write, mut ws_read) = stream.split();
    let mut closing = false;
    let close_timer = sleep(CLOSE_ACK_TIMEOUT);
    tokio::pin!(close_timer);

    let last = loop {
        tokio::select! {
            () = &mut close_timer, if closing => {
                break LinkEvent::Closed {
                    code: ABNORMAL_CLOSE_CODE,
                    reason: "close not acknowledged".to_string(),
                };
            }
            cmd = commands.recv(), if !closing => {
                match cmd {
                    Some(Outbound::Text { payload, written }) => {
                        tracing::trace!(bytes = payload.len(), "ws send");
                        let res = ws_write
                            .send(Message::Text(payload.into()))
                            .await
                            .map_err(|e| StreamError::Ws(e.to_string()));
                        let failed = res.as_ref().err().map(ToString::to_string);
                        let _ = written.send(res);
                        if let Some(err) = failed {
                            break LinkEvent::Error(err);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        // Owner went away or asked to close: start the closing
                        // handshake and keep reading until the peer answers.
                        closing = true;
                        close_timer.as_mut().reset(Instant::now() + CLOSE_ACK_TIMEOUT);
                        if let Err(e) = ws_write.send(Message::Close(None)).await {
                            break LinkEvent::Error(format!("websocket close failed: {e}"));
                        }
                    }
                }
            }
            item = ws_read.next() => {
                let Some(item) = item else {
                    break LinkEvent::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: "stream ended".to_string(),
                    };
                };
                let msg = match item {
                    Ok(msg) => msg,
                    Err(e) => break LinkEvent::Error(format!("websocket transport error: {e}")),
                };
                let event = match msg {
                    Message::Text(text) => LinkEvent::Message(text.to_string()),
                    Message::Binary(bytes) => LinkEvent::Binary(bytes.to_vec()),
                    Message::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(frame) => (frame.code.into(), frame.reason.to_string()),
                            None => (1000u16, String::new()),
                        };
                        break LinkEvent::Closed { code, reason };
                    }
                    _ => continue,
                };
                if events.send(event).await.is_err() {
                    tracing::debug!("link owner dropped, closing websocket");
                    closing = true;
                    close_timer.as_mut().reset(Instant::now() + CLOSE_ACK_TIMEOUT);
                    let _ = ws_write.send(Message::Close(None)).await;
                }
            }
        }
    };

    tracing::debug!(event = ?last, "websocket link finished");
    let _ = events.send(last).await;
}
