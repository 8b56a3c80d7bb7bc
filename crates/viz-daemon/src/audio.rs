use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use viz_proto::bands::BandVector;
use viz_proto::config::AudioConfig;

use crate::spectrum::SpectrumBinner;
use crate::store::Latest;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no audio input device available")]
    NoDevice,
    #[error("no input device matching {0:?}")]
    DeviceNotFound(String),
    #[error("failed to enumerate input devices: {0}")]
    Devices(#[from] cpal::DevicesError),
    #[error("failed to query input config: {0}")]
    Config(String),
    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),
    #[error("failed to build input stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start input stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
}

// ── block assembly ────────────────────────────────────────────────────────────

/// Runs on the driver's realtime thread: downmixes callback buffers of any
/// size to mono, cuts fixed-size blocks, bins them and publishes with
/// `try_store`.  No blocking or allocation once running.
pub struct BlockAssembler {
    channels: usize,
    block: Vec<f32>,
    filled: usize,
    binner: SpectrumBinner,
    out: Latest<BandVector>,
    blocks: u64,
}

impl BlockAssembler {
    pub fn new(
        block_size: usize,
        channels: usize,
        binner: SpectrumBinner,
        out: Latest<BandVector>,
    ) -> Self {
        let block_size = block_size.max(1);
        Self {
            channels: channels.max(1),
            block: vec![0.0; block_size],
            filled: 0,
            binner: binner.with_block_size(block_size),
            out,
            blocks: 0,
        }
    }

    /// Blocks analysed so far.
    #[cfg(test)]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    #[cfg(test)]
    pub fn push_interleaved(&mut self, data: &[f32]) {
        self.push_interleaved_with(data, |s| s);
    }

    /// Feed interleaved frames, converting each sample with `convert`.
    /// A trailing partial frame is ignored.
    pub fn push_interleaved_with<T: Copy>(&mut self, data: &[T], convert: impl Fn(T) -> f32) {
        let channels = self.channels;
        let scale = 1.0 / channels as f32;
        for frame in data.chunks_exact(channels) {
            let mono = frame.iter().map(|&s| convert(s)).sum::<f32>() * scale;
            self.block[self.filled] = mono;
            self.filled += 1;
            if self.filled == self.block.len() {
                self.filled = 0;
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        let bands = self.binner.process(&self.block);
        self.blocks += 1;
        self.out.try_store(bands);
    }
}

// ── device capture ────────────────────────────────────────────────────────────

/// A running input stream.  Dropping it stops capture.
///
/// `cpal::Stream` is not `Send` on every platform, so this stays on the thread
/// that created it (the runtime's main thread).
pub struct AudioCapture {
    stream: Option<cpal::Stream>,
    health: StreamHealth,
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioCapture {
    /// Stop the stream and leave silence behind for readers.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Audio stream pause failed: {}", e);
            }
            drop(stream);
            self.health.lost();
            let bands = &self.health.bands;
            info!(
                "Audio capture stopped ({} band updates published, {} dropped under contention)",
                bands.version(),
                bands.dropped()
            );
        }
    }
}

/// Liveness shared by `AudioCapture` and the stream's error callback.
#[derive(Clone)]
struct StreamHealth {
    bands: Latest<BandVector>,
    active: Arc<AtomicBool>,
}

impl StreamHealth {
    /// Capture ended: readers get silence and the flag reads false.
    fn lost(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.bands.store(BandVector::silent());
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Open the configured input device and start feeding `bands`.  `active` is
/// raised once the stream plays and cleared when it fails or stops.
pub fn start_capture(
    config: &AudioConfig,
    bands: Latest<BandVector>,
    active: Arc<AtomicBool>,
) -> Result<AudioCapture, AudioError> {
    let host = cpal::default_host();

    info!("--- available input devices ---");
    if let Ok(devices) = host.input_devices() {
        for (i, dev) in devices.enumerate() {
            let name = dev.name().unwrap_or_else(|_| "Unknown".into());
            info!("  [{}]: {}", i, name);
        }
    }

    let device = select_device(&host, config.device.as_deref())?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".into());

    let supported = pick_stream_config(&device, config.sample_rate)?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();
    let sample_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels;

    if let Some(requested) = config.sample_rate {
        if requested != sample_rate {
            warn!(
                "Requested {} Hz but device runs at {} Hz; binning at {} Hz",
                requested, sample_rate, sample_rate
            );
        }
    }

    info!(
        "Capturing from {:?}: {:?} @ {} Hz, {} channel(s), block {}",
        device_name, sample_format, sample_rate, channels, config.block_size
    );

    let assembler = BlockAssembler::new(
        config.block_size,
        channels as usize,
        SpectrumBinner::new(sample_rate),
        bands.clone(),
    );

    let health = StreamHealth { bands, active };
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, assembler, health.clone()),
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, assembler, health.clone()),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, assembler, health.clone()),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }?;

    stream.play()?;
    health.active.store(true, Ordering::Relaxed);

    Ok(AudioCapture {
        stream: Some(stream),
        health,
        device_name,
        sample_rate,
        channels,
    })
}

fn select_device(host: &cpal::Host, wanted: Option<&str>) -> Result<cpal::Device, AudioError> {
    let Some(wanted) = wanted.filter(|w| !w.trim().is_empty()) else {
        return host.default_input_device().ok_or(AudioError::NoDevice);
    };

    let needle = wanted.to_lowercase();
    for device in host.input_devices()? {
        let name = device.name().unwrap_or_default();
        if name.to_lowercase().contains(&needle) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(wanted.to_string()))
}

/// The device default, or a supported range containing `rate` when one was
/// requested.  Prefers f32 among matching ranges.
fn pick_stream_config(
    device: &cpal::Device,
    rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    if let Some(rate) = rate {
        let ranges: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| AudioError::Config(e.to_string()))?
            .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
            .collect();

        let best = ranges
            .iter()
            .find(|r| r.sample_format() == SampleFormat::F32)
            .or_else(|| ranges.first());

        if let Some(range) = best {
            return Ok(range.clone().with_sample_rate(cpal::SampleRate(rate)));
        }
        debug!("No input config supports {} Hz, using device default", rate);
    }

    device
        .default_input_config()
        .map_err(|e| AudioError::Config(e.to_string()))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: BlockAssembler,
    health: StreamHealth,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            assembler.push_interleaved_with(data, f32::from_sample);
        },
        move |err| {
            error!("Audio input error: {}", err);
            health.lost();
        },
        None,
    )?;
    Ok(stream)
}
