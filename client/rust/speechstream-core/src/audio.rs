#[cfg(feature = "audio")]
use anyhow::{Context, Result};
#[cfg(feature = "audio")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Full-scale divisor for signed 16-bit PCM.
pub const PCM16_SCALE: f32 = 32768.0;

#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Number of bytes needed to hold `ms` milliseconds of mono 16-bit audio.
pub fn pcm16_bytes_for_ms(sample_rate_hz: u32, ms: u32) -> usize {
    ((sample_rate_hz as u64 * ms as u64) / 1000) as usize * 2
}

/// Inverse of [`pcm16_bytes_for_ms`], rounded down.
pub fn pcm16_ms_for_bytes(sample_rate_hz: u32, bytes: usize) -> u64 {
    if sample_rate_hz == 0 {
        return 0;
    }
    (bytes as u64 / 2) * 1000 / sample_rate_hz as u64
}

/// Device output driven by a render callback.
///
/// `render` is called on the audio thread with the interleaved output block and
/// the channel count. It must not block or allocate.
#[cfg(feature = "audio")]
pub struct AudioOutput {
    _stream: cpal::Stream,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub device_name: String,
}

#[cfg(feature = "audio")]
impl AudioOutput {
    pub fn start<F>(sample_rate_hz: u32, buffer_frames: Option<u32>, mut render: F) -> Result<Self>
    where
        F: FnMut(&mut [f32], usize) + Send + 'static,
    {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no output device available")?;

        let wanted = cpal::SampleRate(sample_rate_hz);
        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= wanted
                && wanted <= c.max_sample_rate()
        };

        let config_range = {
            let mut mono = device
                .supported_output_configs()?
                .filter(|c| supports_rate(c) && c.channels() == 1);
            match mono.next() {
                Some(range) => range,
                None => device
                    .supported_output_configs()?
                    .find(|c| supports_rate(c))
                    .with_context(|| {
                        format!("output device does not support f32 output at {sample_rate_hz} Hz")
                    })?,
            }
        };

        let mut config: cpal::StreamConfig = config_range.with_sample_rate(wanted).into();
        if let Some(frames) = buffer_frames
            && frames > 0
        {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }
        let channels = config.channels as usize;
        let device_name = device.name().unwrap_or_else(|_| "unk".to_string());

        tracing::info!(
            device = %device_name,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            buffer = ?config.buffer_size,
            "opening audio output"
        );

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data, channels),
            move |err| tracing::warn!(%err, "audio output stream error"),
            None,
        )?;
        stream.play()?;

        Ok(Self {
            _stream: stream,
            sample_rate_hz: config.sample_rate.0,
            channels: config.channels,
            device_name,
        })
    }
}
