//! Microphone capture
//!
//! Records mono float PCM at 16 kHz through PulseAudio and hands fixed-size
//! frames to a callback on a dedicated thread. The device is only open while
//! capture runs; stopping closes it before returning.

use crate::encoder::{FRAME_SAMPLES, INPUT_SAMPLE_RATE};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio backend error: {0}")]
    Backend(String),
}

impl CaptureError {
    fn from_pulse(err: PAErr) -> Self {
        let text = format!("{}", err);
        if err == PAErr::from(Code::Access) {
            CaptureError::PermissionDenied(text)
        } else if err == PAErr::from(Code::NoEntity) || err == PAErr::from(Code::ConnectionRefused) {
            CaptureError::DeviceUnavailable(text)
        } else {
            CaptureError::Backend(text)
        }
    }
}

/// Something that fills float frames at [`INPUT_SAMPLE_RATE`], blocking until
/// a full frame is available.
pub trait FrameSource {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), CaptureError>;
}

/// Opens a [`FrameSource`]. Called on the capture thread, so the source
/// itself need not be `Send`.
pub trait MicrophoneOpener: Send + Sync + 'static {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, CaptureError>;
}

/// PulseAudio record stream
pub struct PulseSource {
    simple: Simple,
    bytes: Vec<u8>,
}

impl FrameSource for PulseSource {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), CaptureError> {
        self.bytes.resize(frame.len() * 4, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(CaptureError::from_pulse)?;
        for (sample, raw) in frame.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(())
    }
}

/// Opens the default (or a named) PulseAudio source.
#[derive(Debug, Clone)]
pub struct PulseMicrophone {
    app_name: String,
    device: Option<String>,
}

impl PulseMicrophone {
    pub fn new(app_name: &str, device: Option<String>) -> Self {
        Self {
            app_name: app_name.to_string(),
            device,
        }
    }
}

impl MicrophoneOpener for PulseMicrophone {
    type Source = PulseSource;

    fn open(&self) -> Result<PulseSource, CaptureError> {
        // PulseAudio resamples whatever the device delivers to this spec.
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: INPUT_SAMPLE_RATE,
        };
        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Record,
            self.device.as_deref(),
            "microphone",
            &spec,
            None,
            None,
        )
        .map_err(CaptureError::from_pulse)?;

        info!(
            "Microphone opened ({})",
            self.device.as_deref().unwrap_or("default source")
        );
        Ok(PulseSource {
            simple,
            bytes: Vec::with_capacity(FRAME_SAMPLES * 4),
        })
    }
}

/// A running capture that ended on its own because the device failed.
#[derive(Debug)]
pub struct CaptureFault {
    /// Which `start` the failed capture came from.
    pub generation: u64,
    pub error: CaptureError,
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owns the capture thread. Frames flow only between `start` and `stop`.
#[derive(Default)]
pub struct CapturePipeline {
    worker: Option<CaptureWorker>,
    generation: u64,
    faults: Option<UnboundedSender<CaptureFault>>,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pipeline that reports mid-stream device failures on `faults`.
    pub fn with_faults(faults: UnboundedSender<CaptureFault>) -> Self {
        Self {
            worker: None,
            generation: 0,
            faults: Some(faults),
        }
    }

    /// Bumped on every successful `start`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire))
    }

    /// Open the microphone and start delivering frames to `on_frame`.
    /// Returns once the device is open, or with the reason it could not be.
    /// Starting while already running is a no-op.
    pub fn start<M, F>(&mut self, opener: Arc<M>, mut on_frame: F) -> Result<(), CaptureError>
    where
        M: MicrophoneOpener,
        F: FnMut(&[f32]) + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        // A worker whose device failed mid-stream is reaped here.
        self.stop();

        let generation = self.generation + 1;
        let faults = self.faults.clone();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let (ready_tx, ready_rx) = sync_channel::<Result<(), CaptureError>>(1);

        let thread = std::thread::Builder::new()
            .name("rhovoice-capture".to_string())
            .spawn(move || {
                let mut source = match opener.open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut frame = vec![0.0f32; FRAME_SAMPLES];
                let mut failure = None;
                while thread_running.load(Ordering::Acquire) {
                    if let Err(e) = source.read_frame(&mut frame) {
                        failure = Some(e);
                        break;
                    }
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }
                    on_frame(&frame);
                }
                thread_running.store(false, Ordering::Release);

                if let Some(error) = failure {
                    error!("Microphone read failed: {}", error);
                    if let Some(faults) = faults {
                        let _ = faults.send(CaptureFault { generation, error });
                    }
                }
                debug!("Capture thread exiting");
            })
            .map_err(|e| CaptureError::Backend(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { running, thread });
                self.generation = generation;
                info!("Capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::Backend("capture thread exited early".to_string()))
            }
        }
    }

    /// Stop capture and release the device. Safe to call at any time.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            if worker.thread.join().is_err() {
                error!("Capture thread panicked");
            }
            info!("Capture stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A PulseAudio source as reported by the server
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub is_monitor: bool,
}

/// List the sources known to the PulseAudio server.
pub fn list_input_devices() -> Result<Vec<InputDevice>, CaptureError> {
    let backend = |msg: &str| CaptureError::Backend(msg.to_string());

    let mut mainloop = Mainloop::new().ok_or_else(|| backend("failed to create mainloop"))?;
    let mut context = Context::new(&mainloop, "rhovoice-device-lister")
        .ok_or_else(|| backend("failed to create context"))?;
    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(CaptureError::from_pulse)?;

    loop {
        match mainloop.iterate(true) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(backend("mainloop iterate failed"));
            }
            IterateResult::Success(_) => {}
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(CaptureError::DeviceUnavailable(
                    "could not connect to the PulseAudio server".to_string(),
                ));
            }
            _ => {}
        }
    }

    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let (devices_cb, done_cb) = (devices.clone(), done.clone());

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(info) => {
            let is_monitor = info.monitor_of_sink.is_some();
            if let (Some(name), Some(description)) = (&info.name, &info.description) {
                if let Ok(mut devices) = devices_cb.lock() {
                    devices.push(InputDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        is_monitor,
                    });
                }
            }
        }
        ListResult::End => done_cb.store(true, Ordering::Release),
        ListResult::Error => {
            error!("Error listing audio sources");
            done_cb.store(true, Ordering::Release);
        }
    });

    while !done.load(Ordering::Acquire) {
        match mainloop.iterate(true) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(backend("mainloop iterate failed"));
            }
            IterateResult::Success(_) => {}
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let devices = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| backend("device list poisoned"))?;
    Ok(devices)
}
