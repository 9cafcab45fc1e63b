//! Real-time side of the pipeline.
//!
//! [`PlaybackBridge::render`] runs on the audio device thread. It only touches
//! the sample buffer through `try_lock`, never allocates, and fills whatever
//! it could not get from the buffer with silence.

use crate::buffer::SampleBuffer;
use speechstream_core::audio::pcm16_to_f32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "playback")]
use crate::error::{Result, StreamError};
#[cfg(feature = "playback")]
use speechstream_core::audio::AudioOutput;

/// Samples drained per step; bounds the stack scratch space.
const SCRATCH_SAMPLES: usize = 256;

/// Shared handle for pausing playback and reading its counters.
#[derive(Debug, Default)]
pub struct PlaybackControl {
    paused: AtomicBool,
    underruns: AtomicU64,
    frames_rendered: AtomicU64,
}

impl PlaybackControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Blocks that came back shorter than the device asked for.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Frames of real (non-padding) audio handed to the device.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }
}

pub struct PlaybackBridge {
    buffer: Arc<SampleBuffer>,
    control: Arc<PlaybackControl>,
    scratch: [i16; SCRATCH_SAMPLES],
}

impl PlaybackBridge {
    pub fn new(buffer: Arc<SampleBuffer>, control: Arc<PlaybackControl>) -> Self {
        Self {
            buffer,
            control,
            scratch: [0; SCRATCH_SAMPLES],
        }
    }

    pub fn control(&self) -> Arc<PlaybackControl> {
        self.control.clone()
    }

    /// Fills one interleaved output block. Mono samples are copied into every
    /// channel. Returns the number of frames that carry real audio.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> usize {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        if self.control.is_paused() {
            out.fill(0.0);
            return 0;
        }

        let mut filled = 0;
        while filled < frames {
            let want = (frames - filled).min(SCRATCH_SAMPLES);
            let got = self.buffer.drain_into(&mut self.scratch[..want]);
            for (i, &sample) in self.scratch[..got].iter().enumerate() {
                let start = (filled + i) * channels;
                out[start..start + channels].fill(pcm16_to_f32(sample));
            }
            filled += got;
            if got < want {
                break;
            }
        }

        out[filled * channels..].fill(0.0);
        if filled < frames {
            self.control.underruns.fetch_add(1, Ordering::Relaxed);
        }
        self.control
            .frames_rendered
            .fetch_add(filled as u64, Ordering::Relaxed);
        filled
    }

    /// Opens the default output device and drives this bridge from its callback.
    #[cfg(feature = "playback")]
    pub fn start_output(
        mut self,
        sample_rate_hz: u32,
        buffer_frames: Option<u32>,
    ) -> Result<AudioOutput> {
        AudioOutput::start(sample_rate_hz, buffer_frames, move |out, channels| {
            self.render(out, channels);
        })
        .map_err(|e| StreamError::Message(format!("audio output: {e:#}")))
    }
}
