//! Gapless playback scheduling
//!
//! Model speech arrives as discrete PCM chunks. Each chunk is scheduled to
//! start exactly where the previous one ends on the output clock, so an
//! utterance plays back without gaps or overlaps. An interruption stops
//! everything queued or playing and resets the cursor.

use crate::encoder::{decode_pcm16, CodecError, OUTPUT_SAMPLE_RATE};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Identifies one scheduled buffer on an [`AudioOutput`].
pub type HandleId = u64;

/// Mono float PCM at a fixed rate
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A device that plays buffers at given times on its own clock.
pub trait AudioOutput: Send {
    /// Current time of the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Queue `buffer` to start at `at` seconds. Completion is reported by the
    /// output through its own channel.
    fn start(&mut self, buffer: PcmBuffer, at: f64) -> HandleId;

    /// Stop a queued or playing buffer immediately. Unknown ids are ignored.
    fn stop(&mut self, id: HandleId);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: HandleId,
    pub start: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    next_start: f64,
    in_flight: HashSet<HandleId>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    /// Start a scheduler whose cursor sits at the output's current time.
    pub fn new(output: O) -> Self {
        let next_start = output.current_time();
        Self {
            output,
            next_start,
            in_flight: HashSet::new(),
        }
    }

    /// Decode a 16-bit PCM delta at the output rate and schedule it.
    pub fn schedule_pcm(&mut self, bytes: &[u8]) -> Result<Scheduled, CodecError> {
        let samples = decode_pcm16(bytes)?;
        if samples.is_empty() {
            return Err(CodecError::EmptyFrame);
        }
        Ok(self.schedule(PcmBuffer::new(samples, OUTPUT_SAMPLE_RATE)))
    }

    /// Schedule `buffer` right after everything already scheduled, but never
    /// in the past.
    pub fn schedule(&mut self, buffer: PcmBuffer) -> Scheduled {
        let now = self.output.current_time();
        self.next_start = self.next_start.max(now);

        let start = self.next_start;
        let duration = buffer.duration();
        let id = self.output.start(buffer, start);
        self.in_flight.insert(id);
        self.next_start += duration;

        trace!(
            "Scheduled buffer {} at {:.3}s for {:.3}s ({} in flight)",
            id,
            start,
            duration,
            self.in_flight.len()
        );

        Scheduled {
            id,
            start,
            duration,
        }
    }

    /// A buffer finished naturally. Returns false for ids this scheduler does
    /// not track (already flushed, or owned by another session).
    pub fn on_ended(&mut self, id: HandleId) -> bool {
        self.in_flight.remove(&id)
    }

    /// Stop everything queued or playing and reset the cursor to zero.
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in self.in_flight.drain() {
            self.output.stop(id);
        }
        self.next_start = 0.0;
        if stopped > 0 {
            debug!("Playback interrupted, stopped {} buffer(s)", stopped);
        }
        stopped
    }

    /// Move the cursor to the output's current time, as at session start.
    pub fn rebase(&mut self) {
        self.next_start = self.output.current_time();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_tracking(&self, id: HandleId) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeOutput {
        now: f64,
        next_id: HandleId,
        started: Vec<(HandleId, f64, f64)>,
        stopped: Vec<HandleId>,
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            self.now
        }

        fn start(&mut self, buffer: PcmBuffer, at: f64) -> HandleId {
            self.next_id += 1;
            self.started.push((self.next_id, at, buffer.duration()));
            self.next_id
        }

        fn stop(&mut self, id: HandleId) {
            self.stopped.push(id);
        }
    }

    fn buffer(samples: usize) -> PcmBuffer {
        PcmBuffer::new(vec![0.0; samples], OUTPUT_SAMPLE_RATE)
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_back_to_back_without_gaps() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        scheduler.output_mut().now = 1.5;

        let sizes = [2400, 4800, 240, 24000];
        let mut expected = 1.5;
        for size in sizes {
            let s = scheduler.schedule(buffer(size));
            assert_close(s.start, expected);
            expected += size as f64 / OUTPUT_SAMPLE_RATE as f64;
        }

        assert_eq!(scheduler.in_flight(), sizes.len());
        assert_close(scheduler.next_start(), expected);
    }

    #[test]
    fn test_cursor_never_schedules_in_the_past() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        let first = scheduler.schedule(buffer(2400));
        assert_close(first.start, 0.0);

        // Delivery lagged well past the end of the first buffer.
        scheduler.output_mut().now = 3.0;
        let second = scheduler.schedule(buffer(2400));
        assert_close(second.start, 3.0);
        assert_close(scheduler.next_start(), 3.1);
    }

    #[test]
    fn test_cursor_starts_at_clock_time() {
        let output = FakeOutput {
            now: 7.25,
            ..Default::default()
        };
        let scheduler = PlaybackScheduler::new(output);
        assert_close(scheduler.next_start(), 7.25);
    }

    #[test]
    fn test_natural_completion_leaves_set() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        let a = scheduler.schedule(buffer(100));
        let b = scheduler.schedule(buffer(100));

        assert!(scheduler.on_ended(a.id));
        assert!(!scheduler.on_ended(a.id));
        assert!(!scheduler.is_tracking(a.id));
        assert!(scheduler.is_tracking(b.id));
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[test]
    fn test_interrupt_flushes_everything() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        scheduler.output_mut().now = 2.0;
        let ids: Vec<_> = (0..5).map(|_| scheduler.schedule(buffer(4800)).id).collect();
        scheduler.on_ended(ids[0]);

        assert_eq!(scheduler.interrupt(), 4);
        assert_eq!(scheduler.in_flight(), 0);
        assert_close(scheduler.next_start(), 0.0);

        let mut stopped = scheduler.output().stopped.clone();
        stopped.sort();
        assert_eq!(stopped, ids[1..].to_vec());

        // Completion of a flushed buffer is ignored.
        assert!(!scheduler.on_ended(ids[2]));
    }

    #[test]
    fn test_next_turn_after_interrupt_starts_at_clock() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        scheduler.output_mut().now = 4.0;
        scheduler.schedule(buffer(24000));
        scheduler.interrupt();

        scheduler.output_mut().now = 4.2;
        let next = scheduler.schedule(buffer(2400));
        assert_close(next.start, 4.2);
    }

    #[test]
    fn test_rebase_follows_clock() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        scheduler.interrupt();
        scheduler.output_mut().now = 9.0;
        scheduler.rebase();
        assert_close(scheduler.next_start(), 9.0);
    }

    #[test]
    fn test_interrupt_when_idle() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        assert_eq!(scheduler.interrupt(), 0);
        assert!(scheduler.output().stopped.is_empty());
    }

    #[test]
    fn test_schedule_pcm_decodes_at_output_rate() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        let bytes = vec![0u8; 4800];
        let s = scheduler.schedule_pcm(&bytes).unwrap();
        assert_close(s.duration, 0.1);

        assert!(matches!(
            scheduler.schedule_pcm(&[1, 2, 3]),
            Err(CodecError::OddLength(3))
        ));
        assert!(matches!(scheduler.schedule_pcm(&[]), Err(CodecError::EmptyFrame)));
        assert_eq!(scheduler.in_flight(), 1);
    }
}
