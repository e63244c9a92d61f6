//! Level visualization
//!
//! Two analysis taps (capture and playback) collect the most recent samples.
//! A sampler task turns them into frequency-bar snapshots on a steady tick.
//! Audio threads only ever `try_lock` a tap, so sampling can never stall them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Window length of the analyser.
pub const ANALYSIS_SIZE: usize = 256;
/// Bars drawn for the capture path.
pub const INPUT_BARS: usize = 32;
/// Bars drawn for the playback path.
pub const OUTPUT_BARS: usize = 24;
/// Roughly one display refresh at 30 Hz.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(33);

const SMOOTHING: f32 = 0.8;
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

/// Holds the latest [`ANALYSIS_SIZE`] samples of one signal path.
#[derive(Clone, Default)]
pub struct Tap {
    ring: Arc<Mutex<VecDeque<f32>>>,
}

impl Tap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples. Skipped when the sampler holds the lock.
    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut ring) = self.ring.try_lock() {
            ring.extend(samples.iter().copied());
            let excess = ring.len().saturating_sub(ANALYSIS_SIZE);
            ring.drain(..excess);
        }
    }

    /// Latest window, zero-padded at the front when not yet full.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut window = vec![0.0; ANALYSIS_SIZE];
        if let Ok(ring) = self.ring.lock() {
            let offset = ANALYSIS_SIZE - ring.len();
            for (slot, sample) in window[offset..].iter_mut().zip(ring.iter()) {
                *slot = *sample;
            }
        }
        window
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.clear();
        }
    }
}

/// Byte-scaled magnitude spectrum with temporal smoothing.
pub struct Analyser {
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyser {
    pub fn new() -> Self {
        let window = (0..ANALYSIS_SIZE)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / ANALYSIS_SIZE as f32).cos())
            .collect();
        Self {
            window,
            smoothed: vec![0.0; ANALYSIS_SIZE / 2],
        }
    }

    /// One value per bin in 0..=255, -100 dB and below mapping to 0.
    pub fn byte_frequency_data(&mut self, samples: &[f32]) -> Vec<u8> {
        let n = ANALYSIS_SIZE;
        let mut out = Vec::with_capacity(n / 2);

        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, (&x, &w)) in samples.iter().zip(self.window.iter()).take(n).enumerate() {
                let phase = 2.0 * PI * ((k * i) % n) as f32 / n as f32;
                re += x * w * phase.cos();
                im -= x * w * phase.sin();
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;

            let db = 20.0 * smoothed.max(f32::MIN_POSITIVE).log10();
            let scaled = (db - MIN_DB) / (MAX_DB - MIN_DB) * 255.0;
            out.push(scaled.clamp(0.0, 255.0) as u8);
        }

        out
    }
}

/// Average `data` into `count` bars, each scaled to `0..=scale`.
pub fn bars(data: &[u8], count: usize, scale: f32) -> Vec<f32> {
    let bin = if count == 0 { 0 } else { data.len() / count };
    if bin == 0 {
        return vec![0.0; count];
    }
    (0..count)
        .map(|i| {
            let sum: u32 = data[i * bin..(i + 1) * bin].iter().map(|&v| v as u32).sum();
            (sum as f32 / bin as f32) / 255.0 * scale
        })
        .collect()
}

/// What the session is doing, as far as the visualizer cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub recording: bool,
    pub ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Levels {
    pub input: Vec<f32>,
    pub output: Vec<f32>,
}

impl Levels {
    /// Render both paths as one line of block characters.
    pub fn meter_line(&self) -> String {
        const BLOCKS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
        let render = |values: &[f32], full: f32| -> String {
            values
                .iter()
                .map(|v| {
                    let idx = ((v / full) * 8.0).round().clamp(0.0, 8.0) as usize;
                    BLOCKS[idx]
                })
                .collect()
        };
        format!("mic [{}] ai [{}]", render(&self.input, 100.0), render(&self.output, 50.0))
    }
}

pub struct Sampler {
    input: Tap,
    output: Tap,
    input_analyser: Analyser,
    output_analyser: Analyser,
}

impl Sampler {
    pub fn new(input: Tap, output: Tap) -> Self {
        Self {
            input,
            output,
            input_analyser: Analyser::new(),
            output_analyser: Analyser::new(),
        }
    }

    pub fn sample<R: Rng>(&mut self, activity: Activity, rng: &mut R) -> Levels {
        if !activity.recording && !activity.ready {
            return Levels {
                input: (0..INPUT_BARS).map(|_| 3.0 + rng.random::<f32>() * 5.0).collect(),
                output: (0..OUTPUT_BARS).map(|_| 3.0 + rng.random::<f32>() * 5.0).collect(),
            };
        }

        if !activity.recording {
            // Connected but not listening: a gentle idle shimmer.
            return Levels {
                input: (0..INPUT_BARS)
                    .map(|i| {
                        let base = 5.0 + rng.random::<f32>() * 10.0;
                        let shape = (i as f32 / INPUT_BARS as f32 * PI).sin() * 0.5 + 0.5;
                        base * shape
                    })
                    .collect(),
                output: (0..OUTPUT_BARS).map(|_| 5.0 + rng.random::<f32>() * 8.0).collect(),
            };
        }

        let input = self.input_analyser.byte_frequency_data(&self.input.snapshot());
        let output = self.output_analyser.byte_frequency_data(&self.output.snapshot());
        Levels {
            input: bars(&input, INPUT_BARS, 100.0),
            output: bars(&output, OUTPUT_BARS, 50.0),
        }
    }
}

/// Run the sampler on its own task until the returned handle is aborted or
/// every level receiver is dropped.
pub fn spawn_sampler<F>(
    mut sampler: Sampler,
    activity: F,
    period: Duration,
) -> (JoinHandle<()>, watch::Receiver<Levels>)
where
    F: Fn() -> Activity + Send + 'static,
{
    let (tx, rx) = watch::channel(Levels::default());
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rng = StdRng::from_os_rng();
        loop {
            ticker.tick().await;
            let levels = sampler.sample(activity(), &mut rng);
            if tx.send(levels).is_err() {
                break;
            }
        }
    });
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_keeps_latest_window() {
        let tap = Tap::new();
        tap.push(&[1.0; 10]);
        let snap = tap.snapshot();
        assert_eq!(snap.len(), ANALYSIS_SIZE);
        assert!(snap[..ANALYSIS_SIZE - 10].iter().all(|&v| v == 0.0));
        assert!(snap[ANALYSIS_SIZE - 10..].iter().all(|&v| v == 1.0));

        let ramp: Vec<f32> = (0..400).map(|i| i as f32).collect();
        tap.push(&ramp);
        let snap = tap.snapshot();
        assert_eq!(snap[0], 144.0);
        assert_eq!(snap[ANALYSIS_SIZE - 1], 399.0);

        tap.clear();
        assert!(tap.snapshot().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_tap_push_skips_while_locked() {
        let tap = Tap::new();
        let guard = tap.ring.lock().unwrap();
        tap.push(&[1.0; 4]);
        drop(guard);
        assert!(tap.snapshot().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_silence_has_empty_spectrum() {
        let mut analyser = Analyser::new();
        let data = analyser.byte_frequency_data(&[0.0; ANALYSIS_SIZE]);
        assert_eq!(data.len(), ANALYSIS_SIZE / 2);
        assert!(data.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_tone_lands_in_its_bin() {
        let mut analyser = Analyser::new();
        let tone: Vec<f32> = (0..ANALYSIS_SIZE)
            .map(|i| (2.0 * PI * 32.0 * i as f32 / ANALYSIS_SIZE as f32).sin())
            .collect();
        let data = analyser.byte_frequency_data(&tone);
        assert_eq!(data[32], 255);
        assert_eq!(data[100], 0);
    }

    #[test]
    fn test_bars_average_bins() {
        let mut data = vec![0u8; 128];
        data[..4].fill(255);
        let values = bars(&data, 32, 100.0);
        assert_eq!(values.len(), 32);
        assert_eq!(values[0], 100.0);
        assert_eq!(values[1], 0.0);

        assert_eq!(bars(&data, 24, 50.0).len(), 24);
        assert_eq!(bars(&[], 4, 1.0), vec![0.0; 4]);
    }

    #[test]
    fn test_idle_patterns_stay_low() {
        let mut sampler = Sampler::new(Tap::new(), Tap::new());
        let mut rng = StdRng::seed_from_u64(7);

        let idle = sampler.sample(Activity::default(), &mut rng);
        assert_eq!(idle.input.len(), INPUT_BARS);
        assert_eq!(idle.output.len(), OUTPUT_BARS);
        assert!(idle.input.iter().all(|&v| (3.0..8.0).contains(&v)));

        let ready = sampler.sample(
            Activity {
                recording: false,
                ready: true,
            },
            &mut rng,
        );
        assert!(ready.input.iter().all(|&v| (0.0..15.0).contains(&v)));
        assert!(ready.output.iter().all(|&v| (5.0..13.0).contains(&v)));
    }

    #[test]
    fn test_recording_reads_taps() {
        let input = Tap::new();
        let mut sampler = Sampler::new(input.clone(), Tap::new());
        let mut rng = StdRng::seed_from_u64(1);

        let tone: Vec<f32> = (0..ANALYSIS_SIZE)
            .map(|i| (2.0 * PI * 8.0 * i as f32 / ANALYSIS_SIZE as f32).sin())
            .collect();
        input.push(&tone);

        let levels = sampler.sample(
            Activity {
                recording: true,
                ready: true,
            },
            &mut rng,
        );
        assert!(levels.input[2] > 0.0);
        assert!(levels.output.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_meter_line() {
        let levels = Levels {
            input: vec![0.0, 100.0],
            output: vec![50.0],
        };
        assert_eq!(levels.meter_line(), "mic [ █] ai [█]");
    }

    #[tokio::test]
    async fn test_sampler_task_publishes() {
        let (handle, mut rx) = spawn_sampler(
            Sampler::new(Tap::new(), Tap::new()),
            Activity::default,
            Duration::from_millis(5),
        );
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().input.len(), INPUT_BARS);
        handle.abort();
    }
}
