use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use speechstream_client::{
    Connector, ConnectionState, Link, LinkEvent, OverflowPolicy, Outbound, Result, StreamError,
    StreamEvent, Streamer, StreamerConfig,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep};
use url::Url;

const SAMPLES_PER_REPLY: usize = 5;

#[derive(Clone, Debug)]
struct Frame {
    link: usize,
    body: Value,
}

/// In-process stand-in for the synthesis service.
///
/// Every text message is answered, once its end-of-stream arrives, with
/// `SAMPLES_PER_REPLY` samples whose value is the text length, split across
/// two messages at an odd byte offset, followed by `isFinal`.
#[derive(Default)]
struct MockService {
    attempts: AtomicUsize,
    refuse: AtomicUsize,
    connect_delay: Mutex<Duration>,
    frames: Mutex<Vec<Frame>>,
    /// Texts answered with audio but never with `isFinal`.
    hold_final: Mutex<HashSet<String>>,
}

impl MockService {
    fn frames(&self, link: usize) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.link == link)
            .map(|f| f.body.clone())
            .collect()
    }

    fn all_texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.body.get("try_trigger_generation").is_some())
            .filter_map(|f| f.body["text"].as_str().map(str::to_string))
            .collect()
    }

    fn replies_for(&self, text: &str) -> Vec<String> {
        let mut replies = Vec::new();
        if text.starts_with("garbage") {
            replies.push("not json".to_string());
            replies.push(r#"{"audio":"!!!"}"#.to_string());
        }
        if text.starts_with("oops") {
            replies.push(json!({"error": "quota_exceeded", "message": "over quota"}).to_string());
        }

        let pcm: Vec<u8> = std::iter::repeat_n(text.len() as i16, SAMPLES_PER_REPLY)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let (head, tail) = pcm.split_at(3);
        replies.push(json!({"audio": BASE64.encode(head), "isFinal": false}).to_string());
        replies.push(json!({"audio": BASE64.encode(tail), "isFinal": null}).to_string());

        if !self.hold_final.lock().unwrap().contains(text) {
            replies.push(json!({"audio": null, "isFinal": true}).to_string());
        }
        replies
    }
}

struct MockConnector(Arc<MockService>);

impl Connector for MockConnector {
    fn connect(&self, _url: Url) -> BoxFuture<'static, Result<Link>> {
        let service = self.0.clone();
        async move {
            let link_id = service.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = *service.connect_delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if service
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StreamError::ConnectFailure("connection refused".to_string()));
            }
            let (link, commands, events) = Link::pair();
            tokio::spawn(serve(service, link_id, commands, events));
            Ok(link)
        }
        .boxed()
    }
}

async fn serve(
    service: Arc<MockService>,
    link: usize,
    mut commands: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut last_text = String::new();
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Outbound::Text { payload, written } => {
                let body: Value = serde_json::from_str(&payload).unwrap();
                let _ = written.send(Ok(()));
                let is_config = body.get("xi_api_key").is_some();
                let text = body["text"].as_str().unwrap_or_default().to_string();
                service.frames.lock().unwrap().push(Frame { link, body });

                if is_config {
                    continue;
                }
                if !text.is_empty() {
                    last_text = text;
                    continue;
                }
                for reply in service.replies_for(&last_text) {
                    if events.send(LinkEvent::Message(reply)).await.is_err() {
                        return;
                    }
                }
            }
            Outbound::Close => {
                let _ = events
                    .send(LinkEvent::Closed {
                        code: 1000,
                        reason: String::new(),
                    })
                    .await;
                return;
            }
        }
    }
}

fn test_config() -> StreamerConfig {
    StreamerConfig {
        base_url: "ws://mock.invalid".to_string(),
        voice_id: "voice".to_string(),
        api_key: Some("test-key".to_string()),
        ..StreamerConfig::default()
    }
}

fn streamer(service: &Arc<MockService>) -> Streamer {
    streamer_with(service, test_config())
}

fn streamer_with(service: &Arc<MockService>, config: StreamerConfig) -> Streamer {
    Streamer::with_connector(config, Arc::new(MockConnector(service.clone()))).unwrap()
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

fn samples(streamer: &Streamer) -> Vec<i16> {
    streamer
        .buffer()
        .drain(usize::MAX)
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn collected(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(frames: &[Value]) -> Vec<&'static str> {
    frames
        .iter()
        .map(|f| {
            if f.get("xi_api_key").is_some() {
                "config"
            } else if f["text"] == "" {
                "eos"
            } else {
                "text"
            }
        })
        .collect()
}

#[tokio::test]
async fn queued_utterances_play_in_order_with_one_config() {
    let service = Arc::new(MockService::default());
    let streamer = streamer(&service);
    let mut events = streamer.subscribe();

    streamer.speak_queued("a");
    streamer.speak_queued("bb");
    wait_until("queue to finish", || streamer.is_idle()).await;

    let frames = service.frames(1);
    assert_eq!(kinds(&frames), ["config", "text", "eos", "text", "eos"]);
    assert_eq!(
        frames[0],
        json!({
            "text": " ",
            "model_id": "eleven_multilingual_v2",
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.8 },
            "xi_api_key": "test-key",
        })
    );
    assert_eq!(frames[1], json!({"text": "a", "try_trigger_generation": true}));
    assert_eq!(frames[3]["text"], "bb");

    let mut expected = vec![1i16; SAMPLES_PER_REPLY];
    expected.extend(vec![2i16; SAMPLES_PER_REPLY]);
    assert_eq!(samples(&streamer), expected);
    assert_eq!(service.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(streamer.connection_state(), ConnectionState::Open);

    let finished: Vec<_> = collected(&mut events)
        .into_iter()
        .filter(|e| matches!(e, StreamEvent::UtteranceFinished { .. }))
        .collect();
    assert_eq!(finished.len(), 2);
}

#[tokio::test]
async fn speak_now_flushes_queue_and_buffer() {
    let service = Arc::new(MockService::default());
    service.hold_final.lock().unwrap().insert("a".to_string());
    let streamer = streamer(&service);
    let mut events = streamer.subscribe();

    streamer.speak_queued("a");
    streamer.speak_queued("b");
    streamer.speak_queued("c");
    wait_until("first reply to be buffered", || {
        streamer.buffer().buffered_samples() == SAMPLES_PER_REPLY
    })
    .await;

    let handle = streamer.speak_now("now");
    assert_eq!(streamer.queued(), 0);
    assert!(streamer.buffer().is_empty());
    assert_eq!(streamer.buffer().current_generation(), 1);

    handle.await.unwrap().unwrap();
    wait_until("interrupted queue to wind down", || streamer.is_idle()).await;

    assert_eq!(samples(&streamer), vec![3i16; SAMPLES_PER_REPLY]);
    assert_eq!(service.all_texts(), ["a", "now"]);
    // The interrupted turn was still open, so the link was replaced.
    assert_eq!(service.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(kinds(&service.frames(2)), ["config", "text", "eos"]);

    let events = collected(&mut events);
    assert!(events.contains(&StreamEvent::Interrupted { generation: 1 }));
    assert!(events.contains(&StreamEvent::UtteranceFinished { generation: 1 }));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, StreamEvent::UtteranceFailed { .. }))
    );
}

#[tokio::test]
async fn close_while_connecting_fails_once_then_reconnects() {
    let service = Arc::new(MockService::default());
    *service.connect_delay.lock().unwrap() = Duration::from_millis(100);
    let streamer = streamer(&service);
    let mut events = streamer.subscribe();

    streamer.speak_queued("x");
    wait_until("handshake to start", || {
        streamer.connection_state() == ConnectionState::Connecting
    })
    .await;
    streamer.close().await;
    assert_eq!(streamer.connection_state(), ConnectionState::Closed);
    wait_until("failed utterance to settle", || streamer.is_idle()).await;

    let failures: Vec<_> = collected(&mut events)
        .into_iter()
        .filter(|e| matches!(e, StreamEvent::UtteranceFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);

    *service.connect_delay.lock().unwrap() = Duration::ZERO;
    streamer.speak_queued("y");
    wait_until("retry to finish", || streamer.is_idle()).await;

    assert_eq!(service.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(service.all_texts(), ["y"]);
    assert_eq!(samples(&streamer), vec![1i16; SAMPLES_PER_REPLY]);
}

#[tokio::test]
async fn refused_connect_fails_only_that_utterance() {
    let service = Arc::new(MockService::default());
    service.refuse.store(1, Ordering::SeqCst);
    let streamer = streamer(&service);
    let mut events = streamer.subscribe();

    streamer.speak_queued("a");
    streamer.speak_queued("bb");
    wait_until("queue to finish", || streamer.is_idle()).await;

    assert_eq!(service.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(samples(&streamer), vec![2i16; SAMPLES_PER_REPLY]);

    let events = collected(&mut events);
    assert!(events.contains(&StreamEvent::ConnectFailed {
        reason: "connect failed: connection refused".to_string()
    }));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::UtteranceFailed { generation: 0, .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn reconnect_sends_session_config_again() {
    let service = Arc::new(MockService::default());
    let streamer = streamer(&service);

    streamer.speak_queued("a");
    wait_until("first utterance", || streamer.is_idle()).await;
    streamer.close().await;
    assert_eq!(streamer.connection_state(), ConnectionState::Closed);

    streamer.speak_queued("b");
    wait_until("second utterance", || streamer.is_idle()).await;

    assert_eq!(kinds(&service.frames(1)), ["config", "text", "eos"]);
    assert_eq!(kinds(&service.frames(2)), ["config", "text", "eos"]);
    assert_eq!(samples(&streamer).len(), 2 * SAMPLES_PER_REPLY);
}

#[tokio::test]
async fn bad_inbound_messages_keep_the_session_open() {
    let service = Arc::new(MockService::default());
    let streamer = streamer(&service);
    let mut events = streamer.subscribe();

    streamer.speak_queued("garbage");
    streamer.speak_queued("oops");
    wait_until("queue to finish", || streamer.is_idle()).await;

    assert_eq!(streamer.connection_state(), ConnectionState::Open);
    let mut expected = vec![7i16; SAMPLES_PER_REPLY];
    expected.extend(vec![4i16; SAMPLES_PER_REPLY]);
    assert_eq!(samples(&streamer), expected);

    let events = collected(&mut events);
    let decode_errors = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::DecodeError { .. }))
        .count();
    assert_eq!(decode_errors, 2);
    assert!(events.contains(&StreamEvent::ServerError {
        message: "quota_exceeded: over quota".to_string()
    }));
    assert_eq!(service.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn playback_drains_then_underruns_to_silence() {
    let service = Arc::new(MockService::default());
    let streamer = streamer(&service);
    let mut bridge = streamer.playback_bridge();

    let mut block = [1.0f32; 8];
    assert_eq!(bridge.render(&mut block, 1), 0);
    assert_eq!(block, [0.0; 8]);

    streamer.speak_queued("abc");
    wait_until("audio to arrive", || streamer.is_idle()).await;

    let mut block = [1.0f32; 8];
    assert_eq!(bridge.render(&mut block, 1), SAMPLES_PER_REPLY);
    let level = 3.0 / 32768.0;
    assert_eq!(block, [level, level, level, level, level, 0.0, 0.0, 0.0]);
    assert!(streamer.is_drained());

    assert_eq!(bridge.render(&mut block, 1), 0);
    assert_eq!(block, [0.0; 8]);
    assert_eq!(streamer.playback_control().underruns(), 3);
    assert_eq!(
        streamer.playback_control().frames_rendered(),
        SAMPLES_PER_REPLY as u64
    );
}

#[tokio::test]
async fn pause_holds_audio_until_resumed() {
    let service = Arc::new(MockService::default());
    let streamer = streamer(&service);
    let mut bridge = streamer.playback_bridge();

    streamer.speak_queued("ab");
    wait_until("audio to arrive", || streamer.is_idle()).await;

    streamer.pause_playback();
    let mut block = [0.0f32; 4];
    assert_eq!(bridge.render(&mut block, 2), 0);
    assert_eq!(streamer.buffer().buffered_samples(), SAMPLES_PER_REPLY);

    streamer.resume_playback();
    assert_eq!(bridge.render(&mut block, 2), 2);
    assert_eq!(streamer.buffer().buffered_samples(), SAMPLES_PER_REPLY - 2);

    streamer.stop_playback();
    assert!(streamer.buffer().is_empty());
}

#[tokio::test]
async fn turn_timeout_resets_link_and_queue_moves_on() {
    let service = Arc::new(MockService::default());
    service.hold_final.lock().unwrap().insert("a".to_string());
    let streamer = streamer_with(
        &service,
        StreamerConfig {
            turn_timeout_ms: 50,
            ..test_config()
        },
    );
    let mut events = streamer.subscribe();

    streamer.speak_queued("a");
    streamer.speak_queued("bb");
    wait_until("queue to finish", || streamer.is_idle()).await;

    // The stuck turn's link was dropped and the next utterance got a fresh one.
    assert_eq!(service.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(kinds(&service.frames(1)), ["config", "text", "eos"]);
    assert_eq!(kinds(&service.frames(2)), ["config", "text", "eos"]);

    let mut expected = vec![1i16; SAMPLES_PER_REPLY];
    expected.extend(vec![2i16; SAMPLES_PER_REPLY]);
    assert_eq!(samples(&streamer), expected);

    let events = collected(&mut events);
    assert!(events.contains(&StreamEvent::StateChanged {
        from: ConnectionState::Open,
        to: ConnectionState::Closed,
    }));
    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::UtteranceFailed { generation, reason } => Some((*generation, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, 0);
    assert!(failed[0].1.contains("no final audio chunk"));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::UtteranceFinished { .. }))
            .count(),
        1
    );
}

fn small_buffer_config(policy: OverflowPolicy) -> StreamerConfig {
    StreamerConfig {
        buffer_capacity_bytes: 6,
        overflow_policy: policy,
        ..test_config()
    }
}

#[tokio::test]
async fn saturated_buffer_drops_oldest_and_reports_it() {
    let service = Arc::new(MockService::default());
    let streamer = streamer_with(&service, small_buffer_config(OverflowPolicy::DropOldest));
    assert_eq!(streamer.buffer().policy(), OverflowPolicy::DropOldest);
    let mut events = streamer.subscribe();

    // 10 bytes arrive as 3 + 7 into a 6 byte buffer.
    streamer.speak_queued("abc");
    wait_until("utterance to finish", || streamer.is_idle()).await;

    assert_eq!(samples(&streamer), vec![3i16; 3]);
    assert_eq!(streamer.buffer().stats().dropped_bytes, 4);
    let events = collected(&mut events);
    assert!(events.contains(&StreamEvent::BufferSaturated {
        dropped_bytes: 4,
        rejected: false,
    }));
    assert!(events.contains(&StreamEvent::UtteranceFinished { generation: 0 }));
}

#[tokio::test]
async fn saturated_buffer_rejects_new_audio_and_reports_it() {
    let service = Arc::new(MockService::default());
    let streamer = streamer_with(&service, small_buffer_config(OverflowPolicy::RejectNew));
    assert_eq!(streamer.buffer().policy(), OverflowPolicy::RejectNew);
    let mut events = streamer.subscribe();

    streamer.speak_queued("abc");
    wait_until("utterance to finish", || streamer.is_idle()).await;

    // Only the first three bytes made it in; the dangling byte stays queued.
    assert_eq!(streamer.buffer().len_bytes(), 3);
    assert_eq!(samples(&streamer), vec![3i16]);
    assert_eq!(streamer.buffer().stats().rejected_appends, 1);
    let events = collected(&mut events);
    assert!(events.contains(&StreamEvent::BufferSaturated {
        dropped_bytes: 7,
        rejected: true,
    }));
    assert_eq!(streamer.connection_state(), ConnectionState::Open);
}
