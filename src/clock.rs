//! Playback clock - the single time authority for video and audio.
//!
//! Time advances only inside `tick()`, driven by wall-clock deltas while
//! playing, or jumps via explicit seeks. Nothing else mutates the position,
//! so every consumer of a tick sees the same master time.

use std::time::Instant;

#[derive(Debug)]
pub struct PlaybackClock {
    current_us: i64,
    playing: bool,
    last_tick: Option<Instant>,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            current_us: 0,
            playing: false,
            last_tick: None,
        }
    }

    pub fn current_us(&self) -> i64 {
        self.current_us
    }

    pub fn current_seconds(&self) -> f64 {
        self.current_us as f64 / 1_000_000.0
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn play(&mut self) {
        self.playing = true;
        // Timing starts at the next tick; the pause gap must not be counted
        self.last_tick = None;
    }

    pub fn pause(&mut self) {
        self.playing = false;
        self.last_tick = None;
    }

    /// Jump to an absolute position. Valid playing or paused.
    pub fn seek_us(&mut self, target_us: i64) {
        self.current_us = target_us.max(0);
        self.last_tick = None;
    }

    pub fn seek_seconds(&mut self, target: f64) {
        self.seek_us((target * 1_000_000.0).round() as i64);
    }

    /// Advance by the wall-clock delta since the previous tick (while
    /// playing) and return the current time.
    pub fn tick(&mut self) -> i64 {
        if self.playing {
            let now = Instant::now();
            if let Some(last) = self.last_tick {
                self.current_us += now.duration_since(last).as_micros() as i64;
            }
            self.last_tick = Some(now);
        }
        self.current_us
    }
}
