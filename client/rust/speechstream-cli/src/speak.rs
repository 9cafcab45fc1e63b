use anyhow::{Context, Result};
use speechstream_client::{StreamEvent, Streamer, StreamerConfig};
use speechstream_core::audio::pcm16_ms_for_bytes;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const DRAIN_POLL: Duration = Duration::from_millis(50);

const HELP: &str = "\
Type text and press Enter to queue it.
  /now <text>   interrupt and speak <text> immediately
  /stop         drop everything queued or playing
  /pause        pause playback (audio stays buffered)
  /resume       resume playback
  /quit         exit (Ctrl+D works too)";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Queue(String),
    Now(String),
    Stop,
    Pause,
    Resume,
    Quit,
    Help,
    Empty,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Queue(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "now" if !arg.is_empty() => Command::Now(arg.to_string()),
        "stop" => Command::Stop,
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        _ => Command::Unknown(line.to_string()),
    }
}

pub async fn run(
    config: StreamerConfig,
    input: Option<PathBuf>,
    buffer_frames: Option<u32>,
) -> Result<()> {
    let streamer = Streamer::new(config).context("Failed to create streamer")?;
    let output = streamer
        .start_output(buffer_frames)
        .context("Failed to open audio output")?;
    let buffer = streamer.buffer();
    tracing::info!(
        device = %output.device_name,
        sample_rate = output.sample_rate_hz,
        channels = output.channels,
        buffer_ms = pcm16_ms_for_bytes(output.sample_rate_hz, buffer.capacity_bytes()),
        overflow = ?buffer.policy(),
        "playback started"
    );

    let event_log = tokio::spawn(log_events(streamer.subscribe()));

    let res = match input {
        Some(path) => run_file(&streamer, &path).await,
        None => run_interactive(&streamer).await,
    };

    streamer.close().await;
    event_log.abort();

    let stats = streamer.buffer().stats();
    let control = streamer.playback_control();
    let sample_rate = streamer.config().sample_rate;
    tracing::info!(
        received_ms = pcm16_ms_for_bytes(sample_rate, stats.appended_bytes as usize),
        dropped_ms = pcm16_ms_for_bytes(sample_rate, stats.dropped_bytes as usize),
        appended_bytes = stats.appended_bytes,
        dropped_bytes = stats.dropped_bytes,
        stale_bytes = stats.stale_bytes,
        contended_drains = stats.contended_drains,
        frames_rendered = control.frames_rendered(),
        underruns = control.underruns(),
        "session finished"
    );
    drop(output);
    res
}

async fn run_file(streamer: &Streamer, path: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;

    let mut queued = 0usize;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        streamer.speak_queued(line);
        queued += 1;
    }
    if queued == 0 {
        tracing::warn!(file = %path.display(), "input file has nothing to speak");
        return Ok(());
    }
    tracing::info!(utterances = queued, "input queued");

    tokio::select! {
        _ = wait_drained(streamer) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            streamer.stop_playback();
        }
    }
    Ok(())
}

async fn wait_drained(streamer: &Streamer) {
    while !streamer.is_drained() {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

/// Reads stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_interactive(streamer: &Streamer) -> Result<()> {
    println!("{HELP}");
    let mut lines = spawn_stdin_reader();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.recv() => line.transpose().context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Command::Queue(text) => streamer.speak_queued(text),
            Command::Now(text) => {
                // Failures surface through the event log.
                drop(streamer.speak_now(text));
            }
            Command::Stop => streamer.stop_playback(),
            Command::Pause => streamer.pause_playback(),
            Command::Resume => streamer.resume_playback(),
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Empty => {}
            Command::Unknown(cmd) => println!("unknown command: {cmd} (try /help)"),
        }
    }
    println!();
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<StreamEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event log fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            StreamEvent::StateChanged { from, to } => {
                tracing::debug!(%from, %to, "connection state changed")
            }
            StreamEvent::ConnectFailed { reason } => tracing::error!(%reason, "connect failed"),
            StreamEvent::DecodeError { message } => {
                tracing::warn!(%message, "undecodable message from server")
            }
            StreamEvent::ServerError { message } => tracing::error!(%message, "server error"),
            StreamEvent::BufferSaturated {
                dropped_bytes,
                rejected,
            } => tracing::warn!(dropped_bytes, rejected, "sample buffer saturated"),
            StreamEvent::StaleAudioDiscarded { generation, bytes } => {
                tracing::debug!(generation, bytes, "stale audio discarded")
            }
            StreamEvent::UtteranceDispatched { generation, chars } => {
                tracing::info!(generation, chars, "speaking")
            }
            StreamEvent::UtteranceFinished { generation } => {
                tracing::info!(generation, "synthesis finished")
            }
            StreamEvent::UtteranceFailed { generation, reason } => {
                tracing::error!(generation, %reason, "utterance failed")
            }
            StreamEvent::Interrupted { generation } => {
                tracing::info!(generation, "playback interrupted")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_queued() {
        assert_eq!(
            parse_command("  Hello there.  "),
            Command::Queue("Hello there.".to_string())
        );
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(
            parse_command("/now stop everything"),
            Command::Now("stop everything".to_string())
        );
        assert_eq!(parse_command("/stop"), Command::Stop);
        assert_eq!(parse_command("/pause"), Command::Pause);
        assert_eq!(parse_command("/resume"), Command::Resume);
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command("/help"), Command::Help);
    }

    #[test]
    fn bad_commands_are_reported() {
        assert_eq!(parse_command("/now"), Command::Unknown("/now".to_string()));
        assert_eq!(
            parse_command("/volume 3"),
            Command::Unknown("/volume 3".to_string())
        );
    }
}
