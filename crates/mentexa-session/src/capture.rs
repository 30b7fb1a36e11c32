//! Capture pipeline: microphone and camera in, encoded chunks out.
//!
//! The microphone stream lives on its own thread (cpal streams are `!Send` on
//! some platforms) and forwards raw mono frames. A slicer task cuts those into
//! one WAV payload per interval and, on request, flushes early so a released
//! turn does not wait for the next tick. A second task samples the camera.
//!
//! ```text
//!  cpal thread ──frames──▶ slicer ──CaptureEvent::Audio──▶ session queue
//!  FrameSource ──grab───▶ video  ──CaptureEvent::Video──▶ session queue
//! ```

use crate::encoder::{encode_audio, encode_frame, FrameSpec};
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Timing and output shape of one capture run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub audio_slice: Duration,
    pub video_interval: Duration,
    pub video_enabled: bool,
    pub frame: FrameSpec,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            audio_slice: Duration::from_millis(1000),
            video_interval: Duration::from_millis(200),
            video_enabled: true,
            frame: FrameSpec::default(),
        }
    }
}

/// One encoded audio slice.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSlice {
    pub seq: u64,
    /// Base64 WAV.
    pub payload: String,
    /// Mono samples in the slice.
    pub samples: usize,
    /// Produced by a flush (or the final drain on stop) rather than a tick.
    pub flush: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub seq: u64,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Audio(AudioSlice),
    Video(VideoFrame),
}

/// A camera. `Ok(None)` means no frame is available yet.
pub trait FrameSource: Send {
    fn grab(&mut self) -> SessionResult<Option<DynamicImage>>;
}

/// Stands in for a camera by serving the same still image on every grab.
pub struct StillFrameSource {
    image: DynamicImage,
}

impl StillFrameSource {
    pub fn open(path: &Path) -> SessionResult<Self> {
        let image = image::open(path).map_err(|e| {
            SessionError::VideoDevice(format!("cannot open still {}: {}", path.display(), e))
        })?;
        info!(
            "📷 Still frame source {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(Self { image })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self { image }
    }
}

impl FrameSource for StillFrameSource {
    fn grab(&mut self) -> SessionResult<Option<DynamicImage>> {
        if self.image.width() == 0 || self.image.height() == 0 {
            return Ok(None);
        }
        Ok(Some(self.image.clone()))
    }
}

/// Keeps a device thread alive. Dropping it stops the device and joins the thread.
pub struct DeviceGuard {
    stop_tx: Option<std_mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DeviceGuard {
    pub fn new(stop_tx: std_mpsc::Sender<()>, worker: thread::JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        }
    }

    /// A guard with nothing behind it, for sources that need no release.
    pub fn detached() -> Self {
        Self {
            stop_tx: None,
            worker: None,
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("device thread panicked during release");
            }
        }
    }
}

/// Devices handed to a pipeline by [`CaptureDevices::acquire`].
pub struct AcquiredDevices {
    pub microphone: DeviceGuard,
    pub sample_rate: u32,
    pub camera: Option<Box<dyn FrameSource>>,
}

/// Acquires the microphone (and optionally a camera) for one capture run.
/// The microphone pushes mono f32 frames into `frames` until its guard drops.
pub trait CaptureDevices: Send {
    fn acquire(
        &mut self,
        frames: mpsc::UnboundedSender<Vec<f32>>,
    ) -> SessionResult<AcquiredDevices>;
}

/// Default input device through cpal, plus an optional still image as camera.
#[derive(Debug, Clone, Default)]
pub struct LocalDevices {
    pub still_image: Option<PathBuf>,
}

impl LocalDevices {
    pub fn new(still_image: Option<PathBuf>) -> Self {
        Self { still_image }
    }
}

impl CaptureDevices for LocalDevices {
    fn acquire(
        &mut self,
        frames: mpsc::UnboundedSender<Vec<f32>>,
    ) -> SessionResult<AcquiredDevices> {
        let camera: Option<Box<dyn FrameSource>> = match &self.still_image {
            Some(path) => Some(Box::new(StillFrameSource::open(path)?)),
            None => {
                info!("No camera source configured; video disabled for this run");
                None
            }
        };
        let (microphone, sample_rate) = open_microphone(frames)?;
        Ok(AcquiredDevices {
            microphone,
            sample_rate,
            camera,
        })
    }
}

fn open_microphone(frames: mpsc::UnboundedSender<Vec<f32>>) -> SessionResult<(DeviceGuard, u32)> {
    let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<u32>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let worker = thread::Builder::new()
        .name("mentexa-mic".to_string())
        .spawn(move || {
            let stream = match build_input_stream(frames) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Sender dropped or signalled: release the device either way.
            let _ = stop_rx.recv();
            drop(stream);
            info!("🎤 Microphone released");
        })?;

    let sample_rate = ready_rx
        .recv()
        .map_err(|_| SessionError::AudioDevice("microphone thread exited".to_string()))??;
    Ok((DeviceGuard::new(stop_tx, worker), sample_rate))
}

fn build_input_stream(
    frames: mpsc::UnboundedSender<Vec<f32>>,
) -> SessionResult<(cpal::Stream, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| SessionError::AudioDevice("No input device available".to_string()))?;
    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;
    debug!("Input config: {:?} {:?}", config, sample_format);

    let on_error = |err: cpal::StreamError| warn!("Microphone stream error: {}", err);
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = frames.send(downmix(data, channels));
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let normalized: Vec<f32> =
                    data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                let _ = frames.send(downmix(&normalized, channels));
            },
            on_error,
            None,
        )?,
        other => {
            return Err(SessionError::AudioDevice(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;
    info!("✅ Microphone capture started ({}Hz, {} ch)", sample_rate, channels);
    Ok((stream, sample_rate))
}

/// Average interleaved channels down to mono.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

pub struct CapturePipeline;

impl CapturePipeline {
    /// Acquire devices and start slicing. Events are wrapped with `E::from`.
    pub fn start<E>(
        settings: &CaptureSettings,
        devices: &mut dyn CaptureDevices,
        events: mpsc::UnboundedSender<E>,
    ) -> SessionResult<CaptureHandle>
    where
        E: From<CaptureEvent> + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let acquired = devices.acquire(frames_tx)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_slicer(
            frames_rx,
            flush_rx,
            stop_rx.clone(),
            acquired.sample_rate,
            settings.audio_slice,
            events.clone(),
        ));

        match acquired.camera {
            Some(camera) if settings.video_enabled => {
                tokio::spawn(run_video(
                    camera,
                    settings.frame,
                    settings.video_interval,
                    stop_rx,
                    events,
                ));
            }
            _ => debug!("video sampling off"),
        }

        info!(
            "▶️ Capture started ({}ms slices @ {}Hz)",
            settings.audio_slice.as_millis(),
            acquired.sample_rate
        );
        Ok(CaptureHandle {
            stop: stop_tx,
            flush: flush_tx,
            sample_rate: acquired.sample_rate,
            microphone: acquired.microphone,
        })
    }
}

/// Running capture. Dropping it stops capture just like [`CaptureHandle::stop`].
pub struct CaptureHandle {
    stop: watch::Sender<bool>,
    flush: mpsc::UnboundedSender<()>,
    sample_rate: u32,
    microphone: DeviceGuard,
}

impl CaptureHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the slicer is still accepting flush requests.
    pub fn is_running(&self) -> bool {
        !self.flush.is_closed()
    }

    /// Emit whatever is buffered now as a flush slice. False when the slicer
    /// has already ended and no flush slice will follow.
    pub fn request_flush(&self) -> bool {
        if self.flush.send(()).is_err() {
            debug!("flush requested after the slicer ended");
            return false;
        }
        true
    }

    /// Stop both tasks and release the devices. The slicer emits a final flush slice.
    ///
    /// Releasing the microphone joins its thread, so on a runtime that happens
    /// on the blocking pool.
    pub fn stop(self) {
        let _ = self.stop.send(true);
        let microphone = self.microphone;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || drop(microphone));
            }
            Err(_) => drop(microphone),
        }
        info!("⏹️ Capture stopped");
    }
}

async fn run_slicer<E>(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    mut flush: mpsc::UnboundedReceiver<()>,
    mut stop: watch::Receiver<bool>,
    sample_rate: u32,
    slice: Duration,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<CaptureEvent> + Send + 'static,
{
    let mut buffer: Vec<f32> = Vec::new();
    let mut seq = 0u64;
    let mut ticker = interval_at(Instant::now() + slice, slice);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            Some(()) = flush.recv() => {
                drain(&mut frames, &mut buffer);
                if !emit_slice(&events, &mut seq, &mut buffer, sample_rate, true) {
                    return;
                }
                ticker.reset();
            }
            frame = frames.recv() => match frame {
                Some(samples) => buffer.extend(samples),
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() && !emit_slice(&events, &mut seq, &mut buffer, sample_rate, false) {
                    return;
                }
            }
        }
    }

    drain(&mut frames, &mut buffer);
    emit_slice(&events, &mut seq, &mut buffer, sample_rate, true);
    debug!("slicer finished after {} slices", seq);
}

fn drain(frames: &mut mpsc::UnboundedReceiver<Vec<f32>>, buffer: &mut Vec<f32>) {
    while let Ok(samples) = frames.try_recv() {
        buffer.extend(samples);
    }
}

/// Encode and send the buffer. Returns false once nobody is listening.
fn emit_slice<E>(
    events: &mpsc::UnboundedSender<E>,
    seq: &mut u64,
    buffer: &mut Vec<f32>,
    sample_rate: u32,
    flush: bool,
) -> bool
where
    E: From<CaptureEvent>,
{
    let samples = std::mem::take(buffer);
    let encoded = encode_audio(&samples, sample_rate);
    let Some(slice) = audio_slice(*seq + 1, samples.len(), encoded, flush) else {
        return true;
    };
    *seq = slice.seq;
    trace!("slice {} ({} samples, flush={})", seq, slice.samples, flush);
    events.send(E::from(CaptureEvent::Audio(slice))).is_ok()
}

/// Wrap an encoded payload. A flush slice that failed to encode still goes
/// out with an empty payload so the turn it closes is finalized.
fn audio_slice(
    seq: u64,
    samples: usize,
    encoded: SessionResult<String>,
    flush: bool,
) -> Option<AudioSlice> {
    let payload = match encoded {
        Ok(p) => p,
        Err(e) if flush => {
            warn!("flush slice not encoded, sending it empty: {}", e);
            String::new()
        }
        Err(e) => {
            warn!("audio slice dropped: {}", e);
            return None;
        }
    };
    Some(AudioSlice {
        seq,
        payload,
        samples,
        flush,
    })
}

async fn run_video<E>(
    mut camera: Box<dyn FrameSource>,
    spec: FrameSpec,
    every: Duration,
    mut stop: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<CaptureEvent> + Send + 'static,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let image = match camera.grab() {
                    Ok(Some(image)) => image,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("camera grab failed: {}", e);
                        continue;
                    }
                };
                let data_url = match encode_frame(&image, &spec) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!("video frame dropped: {}", e);
                        continue;
                    }
                };
                seq += 1;
                if events.send(E::from(CaptureEvent::Video(VideoFrame { seq, data_url }))).is_err() {
                    break;
                }
            }
        }
    }
    debug!("video sampler finished after {} frames", seq);
}
