//! Gapless scheduling of decoded model audio.
//!
//! The scheduler decides *when* each buffer plays; an [`AudioOutput`] does the
//! actual rendering and owns the output clock. Buffers are queued back to back:
//! the n-th buffer starts at `max(now, start[n-1] + duration[n-1])`.

use std::collections::BTreeMap;
use tracing::debug;

/// Tolerance when comparing buffer end times with the output clock.
const CLOCK_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

/// Decoded PCM ready for playback, one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
    /// Arrival order of the payload this buffer was decoded from.
    pub seq: u64,
}

impl AudioBuffer {
    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    /// Output clock time, in seconds, at which the buffer starts.
    pub start: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// The audio engine a scheduler drives.
#[cfg_attr(test, mockall::automock)]
pub trait AudioOutput {
    /// Seconds elapsed on the output clock.
    fn current_time(&self) -> f64;

    /// Queues `buffer` to start at `start_at` on the output clock.
    fn play(&mut self, id: BufferId, buffer: &AudioBuffer, start_at: f64);

    /// Silences a queued or playing buffer immediately.
    fn stop(&mut self, id: BufferId);
}

pub struct PlaybackScheduler<O> {
    output: O,
    cursor: f64,
    next_id: u64,
    active: BTreeMap<BufferId, ScheduledBuffer>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            cursor: 0.0,
            next_id: 0,
            active: BTreeMap::new(),
        }
    }

    /// Schedules `buffer` right after everything already queued, but never in the past.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> ScheduledBuffer {
        let now = self.output.current_time();
        let start = self.cursor.max(now);
        let duration = buffer.duration();
        let id = BufferId(self.next_id);
        self.next_id += 1;

        self.output.play(id, &buffer, start);
        self.cursor = start + duration;

        let scheduled = ScheduledBuffer {
            id,
            start,
            duration,
        };
        self.active.insert(id, scheduled);
        debug!(?id, seq = buffer.seq, start, duration, "Scheduled model audio");
        scheduled
    }

    /// Removes and returns every buffer that has finished by the output clock.
    pub fn reap(&mut self) -> Vec<BufferId> {
        let now = self.output.current_time();
        let finished: Vec<BufferId> = self
            .active
            .values()
            .filter(|buffer| buffer.end() <= now + CLOCK_EPSILON)
            .map(|buffer| buffer.id)
            .collect();
        for id in &finished {
            self.active.remove(id);
        }
        finished
    }

    /// Marks a buffer as finished. Returns false if it was no longer active.
    pub fn complete(&mut self, id: BufferId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Stops every active buffer and rewinds the cursor so the next buffer
    /// starts at the current clock time.
    pub fn flush(&mut self) -> Vec<BufferId> {
        let stopped: Vec<BufferId> = self.active.keys().copied().collect();
        for id in &stopped {
            self.output.stop(*id);
        }
        self.active.clear();
        self.cursor = 0.0;
        stopped
    }

    pub fn is_drained(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}
