//! PulseAudio playback engine
//!
//! A mixer thread writes fixed blocks to a PulseAudio playback stream and
//! keeps writing silence while idle, so the frame counter it maintains is a
//! steadily advancing output clock. The clock names the first frame not yet
//! rendered, so a buffer started "now" is never partly behind the mixer.
//! Buffers are started at exact frames on that clock and reported back once
//! fully rendered.

use crate::encoder::OUTPUT_SAMPLE_RATE;
use crate::playback::{AudioOutput, HandleId, PcmBuffer};
use crate::visualizer::Tap;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, sync_channel, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// 20 ms at the output rate.
pub const BLOCK_FRAMES: usize = 480;

/// Server-side buffering we ask for; bounds the gap between the clock and
/// what is audible.
const TARGET_LATENCY_FRAMES: u32 = 2400;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to open playback device: {0}")]
    Open(String),

    #[error("Playback thread error: {0}")]
    Thread(String),
}

enum OutputCommand {
    Start {
        id: HandleId,
        buffer: PcmBuffer,
        at_frame: u64,
    },
    Stop(HandleId),
    Shutdown,
}

struct ActiveBuffer {
    id: HandleId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl ActiveBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sums every active buffer into output blocks.
#[derive(Default)]
pub struct Mixer {
    voices: Vec<ActiveBuffer>,
    /// First frame of the next block to render.
    rendered_to: u64,
}

impl Mixer {
    /// Queue `samples` to begin at `start_frame`. A start that is already
    /// behind the mixer begins with the next block instead, from sample 0.
    /// Returns the frame it will actually begin at.
    pub fn start(&mut self, id: HandleId, samples: Vec<f32>, start_frame: u64) -> u64 {
        let start_frame = start_frame.max(self.rendered_to);
        self.voices.push(ActiveBuffer {
            id,
            start_frame,
            samples,
        });
        start_frame
    }

    /// Drop a buffer without reporting it as ended.
    pub fn stop(&mut self, id: HandleId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Render the block beginning at `block_start` into `out`. Returns the
    /// buffers whose last sample fell inside this block.
    pub fn render(&mut self, block_start: u64, out: &mut [f32]) -> Vec<HandleId> {
        out.fill(0.0);
        let block_end = block_start + out.len() as u64;

        for voice in &self.voices {
            if voice.start_frame >= block_end || voice.end_frame() <= block_start {
                continue;
            }
            let first = voice.start_frame.max(block_start);
            let last = voice.end_frame().min(block_end);
            for frame in first..last {
                let src = (frame - voice.start_frame) as usize;
                let dst = (frame - block_start) as usize;
                out[dst] += voice.samples[src];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.rendered_to = self.rendered_to.max(block_end);

        let mut ended = Vec::new();
        self.voices.retain(|v| {
            if v.end_frame() <= block_end {
                ended.push(v.id);
                false
            } else {
                true
            }
        });
        ended
    }
}

/// Cloneable [`AudioOutput`] that forwards to the mixer thread.
#[derive(Clone)]
pub struct OutputHandle {
    commands: mpsc::Sender<OutputCommand>,
    clock: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
}

impl OutputHandle {
    /// The earliest frame a newly started buffer can still play from.
    pub fn next_frame(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }
}

impl AudioOutput for OutputHandle {
    fn current_time(&self) -> f64 {
        self.next_frame() as f64 / OUTPUT_SAMPLE_RATE as f64
    }

    fn start(&mut self, buffer: PcmBuffer, at: f64) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let at_frame = (at * buffer.sample_rate() as f64).round().max(0.0) as u64;
        if buffer.sample_rate() != OUTPUT_SAMPLE_RATE {
            warn!(
                "Buffer at {} Hz played on a {} Hz output",
                buffer.sample_rate(),
                OUTPUT_SAMPLE_RATE
            );
        }
        if self
            .commands
            .send(OutputCommand::Start {
                id,
                buffer,
                at_frame,
            })
            .is_err()
        {
            warn!("Playback thread is gone, dropping buffer {}", id);
        }
        id
    }

    fn stop(&mut self, id: HandleId) {
        let _ = self.commands.send(OutputCommand::Stop(id));
    }
}

/// Owns the playback thread.
pub struct OutputEngine {
    handle: OutputHandle,
    thread: Option<JoinHandle<()>>,
}

impl OutputEngine {
    pub fn handle(&self) -> OutputHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.commands.send(OutputCommand::Shutdown);
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
            info!("Playback stopped");
        }
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open the playback device and start the mixer thread. Ended buffer ids
/// arrive on the returned receiver.
pub fn spawn_output(
    app_name: &str,
    device: Option<String>,
    tap: Tap,
) -> Result<(OutputEngine, UnboundedReceiver<HandleId>), OutputError> {
    let (command_tx, command_rx) = mpsc::channel();
    let (ended_tx, ended_rx) = unbounded_channel();
    let (ready_tx, ready_rx) = sync_channel::<Result<(), OutputError>>(1);
    let clock = Arc::new(AtomicU64::new(0));

    let app_name = app_name.to_string();
    let thread_clock = clock.clone();
    let thread = std::thread::Builder::new()
        .name("rhovoice-playback".to_string())
        .spawn(move || {
            let simple = match open_playback(&app_name, device.as_deref()) {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            run_mixer(simple, command_rx, ended_tx, thread_clock, tap);
        })
        .map_err(|e| OutputError::Thread(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = thread.join();
            return Err(e);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(OutputError::Thread("playback thread exited early".to_string()));
        }
    }

    info!("Playback started at {} Hz", OUTPUT_SAMPLE_RATE);
    let handle = OutputHandle {
        commands: command_tx,
        clock,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    Ok((
        OutputEngine {
            handle,
            thread: Some(thread),
        },
        ended_rx,
    ))
}

fn open_playback(app_name: &str, device: Option<&str>) -> Result<Simple, OutputError> {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: OUTPUT_SAMPLE_RATE,
    };
    let attr = BufferAttr {
        maxlength: u32::MAX,
        tlength: TARGET_LATENCY_FRAMES * 4,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    };
    Simple::new(
        None,
        app_name,
        Direction::Playback,
        device,
        "assistant voice",
        &spec,
        None,
        Some(&attr),
    )
    .map_err(|e| OutputError::Open(format!("{}", e)))
}

fn run_mixer(
    simple: Simple,
    commands: mpsc::Receiver<OutputCommand>,
    ended: UnboundedSender<HandleId>,
    clock: Arc<AtomicU64>,
    tap: Tap,
) {
    let mut mixer = Mixer::default();
    let mut block = vec![0.0f32; BLOCK_FRAMES];
    let mut bytes = Vec::with_capacity(BLOCK_FRAMES * 4);
    let mut block_start = 0u64;

    'outer: loop {
        loop {
            match commands.try_recv() {
                Ok(OutputCommand::Start {
                    id,
                    buffer,
                    at_frame,
                }) => {
                    let start_frame = mixer.start(id, buffer.into_samples(), at_frame);
                    if start_frame != at_frame {
                        debug!("Buffer {} moved from frame {} to {}", id, at_frame, start_frame);
                    }
                }
                Ok(OutputCommand::Stop(id)) => {
                    mixer.stop(id);
                }
                Ok(OutputCommand::Shutdown) | Err(TryRecvError::Disconnected) => break 'outer,
                Err(TryRecvError::Empty) => break,
            }
        }

        let finished = mixer.render(block_start, &mut block);
        block_start += BLOCK_FRAMES as u64;
        // Publish before the write: it blocks, and anything started while
        // it does can only land in the following block.
        clock.store(block_start, Ordering::Release);
        tap.push(&block);

        bytes.clear();
        for sample in &block {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        if let Err(e) = simple.write(&bytes) {
            error!("Playback write failed: {}", e);
            break;
        }

        for id in finished {
            if ended.send(id).is_err() {
                debug!("Nobody is listening for ended buffers");
            }
        }
    }

    if let Err(e) = simple.drain() {
        debug!("Playback drain failed: {}", e);
    }
    debug!("Playback thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_play_at_their_start_frame() {
        let mut mixer = Mixer::default();
        mixer.start(1, vec![0.5; 100], 10);
        let mut out = vec![0.0; 64];

        assert!(mixer.render(0, &mut out).is_empty());
        assert!(out[..10].iter().all(|&s| s == 0.0));
        assert!(out[10..].iter().all(|&s| s == 0.5));

        let ended = mixer.render(64, &mut out);
        assert_eq!(ended, vec![1]);
        assert!(out[..46].iter().all(|&s| s == 0.5));
        assert!(out[46..].iter().all(|&s| s == 0.0));
        assert_eq!(mixer.active(), 0);
    }

    #[test]
    fn test_back_to_back_buffers_are_seamless() {
        let mut mixer = Mixer::default();
        mixer.start(1, vec![0.25; 30], 0);
        mixer.start(2, vec![0.75; 30], 30);
        let mut out = vec![0.0; 60];

        let ended = mixer.render(0, &mut out);
        assert_eq!(ended, vec![1, 2]);
        assert!(out[..30].iter().all(|&s| s == 0.25));
        assert!(out[30..].iter().all(|&s| s == 0.75));
    }

    #[test]
    fn test_stopped_buffer_is_silent_and_not_reported() {
        let mut mixer = Mixer::default();
        mixer.start(7, vec![1.0; 1000], 0);
        assert!(mixer.stop(7));
        assert!(!mixer.stop(7));

        let mut out = vec![0.0; BLOCK_FRAMES];
        assert!(mixer.render(0, &mut out).is_empty());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_overlap_is_clamped() {
        let mut mixer = Mixer::default();
        mixer.start(1, vec![0.8; 8], 0);
        mixer.start(2, vec![0.8; 8], 0);
        let mut out = vec![0.0; 8];
        mixer.render(0, &mut out);
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_start_during_write_plays_from_first_sample() {
        let mut mixer = Mixer::default();
        let mut out = vec![0.0; BLOCK_FRAMES];
        // Block 0 is handed to the device; a buffer arrives asking for frame 0.
        mixer.render(0, &mut out);
        let ramp: Vec<f32> = (0..2 * BLOCK_FRAMES).map(|i| i as f32 / 1000.0).collect();
        assert_eq!(mixer.start(1, ramp.clone(), 0), BLOCK_FRAMES as u64);

        mixer.render(BLOCK_FRAMES as u64, &mut out);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[..], ramp[..BLOCK_FRAMES]);

        let ended = mixer.render(2 * BLOCK_FRAMES as u64, &mut out);
        assert_eq!(ended, vec![1]);
        assert_eq!(out[..], ramp[BLOCK_FRAMES..]);
    }

    #[test]
    fn test_future_start_is_not_moved() {
        let mut mixer = Mixer::default();
        let mut out = vec![0.0; BLOCK_FRAMES];
        mixer.render(0, &mut out);
        assert_eq!(mixer.start(1, vec![0.5; 10], 600), 600);
    }

    #[test]
    fn test_handle_converts_seconds_to_frames() {
        let (tx, rx) = mpsc::channel();
        let mut handle = OutputHandle {
            commands: tx,
            clock: Arc::new(AtomicU64::new(48_000)),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        assert_eq!(handle.current_time(), 2.0);

        let id = handle.start(PcmBuffer::new(vec![0.0; 10], OUTPUT_SAMPLE_RATE), 2.5);
        assert_eq!(id, 1);
        match rx.try_recv().unwrap() {
            OutputCommand::Start { id, at_frame, .. } => {
                assert_eq!(id, 1);
                assert_eq!(at_frame, 60_000);
            }
            _ => panic!("expected a start command"),
        }

        handle.stop(1);
        assert!(matches!(rx.try_recv().unwrap(), OutputCommand::Stop(1)));
        assert_eq!(handle.start(PcmBuffer::new(vec![0.0], OUTPUT_SAMPLE_RATE), 0.0), 2);
    }
}
