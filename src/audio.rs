//! Audio mixing - independently timed tracks summed into one master signal.
//!
//! **Why**: every track carries its own placement, trim, speed, gain and
//! fade ramps, but play/pause/seek must act on all of them as one unit. The
//! mixer owns the uniform transport and the master-time to source-time
//! mapping; per-track cursors only exist so a block render is cheap, and a
//! cursor that drifts past tolerance is snapped back to the mapped position.
//!
//! Tracks carry decoded mono PCM supplied by the embedder; compressed audio
//! never enters the engine.

use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::timeline::TimelineItem;

/// How far a track cursor may drift from the mapped master position before
/// it is re-seeked (seconds).
const DRIFT_TOLERANCE: f64 = 0.05;

/// One placed audio clip.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub id: Uuid,
    /// Decoded mono samples.
    pcm: Arc<Vec<f32>>,
    sample_rate: u32,
    /// Start on the master timeline, seconds.
    position: f64,
    /// Length of the active window on the master timeline.
    duration: f64,
    trim_start: f64,
    trim_end: f64,
    speed: f64,
    gain: f32,
    fade_in: f64,
    fade_out: f64,
    /// Source-local read position, seconds.
    cursor: f64,
}

impl AudioTrack {
    pub fn new(id: Uuid, pcm: Arc<Vec<f32>>, sample_rate: u32) -> Self {
        let source_len = pcm.len() as f64 / sample_rate.max(1) as f64;
        Self {
            id,
            pcm,
            sample_rate,
            position: 0.0,
            duration: source_len,
            trim_start: 0.0,
            trim_end: source_len,
            speed: 1.0,
            gain: 1.0,
            fade_in: 0.0,
            fade_out: 0.0,
            cursor: 0.0,
        }
    }

    /// Build a track from a timeline item plus its decoded PCM.
    pub fn from_item(item: &TimelineItem, pcm: Arc<Vec<f32>>, sample_rate: u32) -> Self {
        let mut track = Self::new(item.id, pcm, sample_rate);
        track.position = item.start_time;
        track.duration = item.duration;
        track.trim_start = item.trim_start();
        if let Some(end) = item.trim_end() {
            track.trim_end = end;
        }
        track.speed = item.speed();
        track.gain = item.volume() as f32;
        track.fade_in = item.fade_in.unwrap_or(0.0).max(0.0);
        track.fade_out = item.fade_out.unwrap_or(0.0).max(0.0);
        track
    }

    /// Gain is clamped to [0, 1]; out-of-range values never pass through.
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_fades(&mut self, fade_in: f64, fade_out: f64) {
        self.fade_in = fade_in.max(0.0);
        self.fade_out = fade_out.max(0.0);
    }

    /// Master time mapped into source-local seconds.
    fn local_time(&self, master: f64) -> f64 {
        self.trim_start + (master - self.position) * self.speed
    }

    fn active_at(&self, master: f64) -> bool {
        master >= self.position && master < self.position + self.duration
    }

    /// Gain envelope at master time: base gain shaped by the fade ramps.
    fn envelope(&self, master: f64) -> f32 {
        let mut env = self.gain as f64;
        if self.fade_in > 0.0 {
            env *= ((master - self.position) / self.fade_in).clamp(0.0, 1.0);
        }
        if self.fade_out > 0.0 {
            let end = self.position + self.duration;
            env *= ((end - master) / self.fade_out).clamp(0.0, 1.0);
        }
        env as f32
    }

    /// Linear-interpolated source sample at local time (seconds).
    fn sample_at(&self, local: f64) -> f32 {
        if local < self.trim_start || local > self.trim_end || local < 0.0 {
            return 0.0;
        }
        let pos = local * self.sample_rate as f64;
        let idx = pos.floor() as usize;
        let frac = (pos - pos.floor()) as f32;
        match (self.pcm.get(idx), self.pcm.get(idx + 1)) {
            (Some(&a), Some(&b)) => a + (b - a) * frac,
            (Some(&a), None) => a,
            _ => 0.0,
        }
    }
}

/// Sums all tracks into one master buffer at a shared output rate.
pub struct AudioMixer {
    tracks: Vec<AudioTrack>,
    output_rate: u32,
    playing: bool,
}

impl AudioMixer {
    pub fn new(output_rate: u32) -> Self {
        Self {
            tracks: Vec::new(),
            output_rate,
            playing: false,
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn add_track(&mut self, track: AudioTrack) {
        self.tracks.push(track);
    }

    pub fn remove_track(&mut self, id: Uuid) {
        self.tracks.retain(|t| t.id != id);
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_mut(&mut self, id: Uuid) -> Option<&mut AudioTrack> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Transport controls apply to every track at once.
    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Snap every track cursor to the mapped position for master time `t`.
    pub fn seek(&mut self, master: f64) {
        for track in &mut self.tracks {
            track.cursor = track.local_time(master);
        }
    }

    /// Render `frames` output samples starting at master time `master`.
    ///
    /// Summation mix: each active track contributes its interpolated sample
    /// scaled by its gain envelope. Cursors advance with the block; a cursor
    /// off by more than the drift tolerance is re-seeked first.
    pub fn mix(&mut self, master: f64, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames];
        let dt = 1.0 / self.output_rate as f64;

        for track in &mut self.tracks {
            let expected = track.local_time(master);
            if (track.cursor - expected).abs() > DRIFT_TOLERANCE {
                debug!(
                    "track {} drifted {:.1} ms, re-seeking",
                    track.id,
                    (track.cursor - expected).abs() * 1000.0
                );
                track.cursor = expected;
            }

            for (i, slot) in out.iter_mut().enumerate() {
                let t = master + i as f64 * dt;
                if !track.active_at(t) {
                    continue;
                }
                let local = track.cursor + i as f64 * dt * track.speed;
                *slot += track.sample_at(local) * track.envelope(t);
            }

            track.cursor += frames as f64 * dt * track.speed;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{ItemKind, Trim};

    /// PCM ramp where sample i has value i, so a sample's value identifies
    /// the exact source position it was read from.
    fn ramp_pcm(seconds: f64, rate: u32) -> Arc<Vec<f32>> {
        let n = (seconds * rate as f64) as usize;
        Arc::new((0..n).map(|i| i as f32).collect())
    }

    #[test]
    fn test_gain_clamped() {
        let mut track = AudioTrack::new(Uuid::new_v4(), ramp_pcm(1.0, 100), 100);
        track.set_gain(2.5);
        assert_eq!(track.gain(), 1.0);
        track.set_gain(-1.0);
        assert_eq!(track.gain(), 0.0);
    }

    /// trim={start:2, end:8}, speed=2, position=0: master 1.0 s reads source
    /// 4.0 s.
    #[test]
    fn test_trim_speed_mapping() {
        let rate = 1000u32;
        let mut item = TimelineItem::new(ItemKind::Audio, "a", 0.0, 3.0);
        item.trim = Some(Trim { start: 2.0, end: 8.0 });
        item.speed = Some(2.0);
        let track = AudioTrack::from_item(&item, ramp_pcm(10.0, rate), rate);

        let mut mixer = AudioMixer::new(rate);
        mixer.add_track(track);
        mixer.seek(1.0);
        let out = mixer.mix(1.0, 1);
        assert!((out[0] - 4000.0).abs() < 2.0);
    }

    #[test]
    fn test_silent_outside_window() {
        let rate = 100u32;
        let mut item = TimelineItem::new(ItemKind::Audio, "a", 2.0, 1.0);
        item.volume = Some(1.0);
        let track = AudioTrack::from_item(&item, ramp_pcm(5.0, rate), rate);
        let mut mixer = AudioMixer::new(rate);
        mixer.add_track(track);

        mixer.seek(0.0);
        let before = mixer.mix(0.0, 10);
        assert!(before.iter().all(|&s| s == 0.0));
        mixer.seek(3.5);
        let after = mixer.mix(3.5, 10);
        assert!(after.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_summation_of_two_tracks() {
        let rate = 100u32;
        let a = AudioTrack::new(Uuid::new_v4(), Arc::new(vec![0.25f32; 200]), rate);
        let b = AudioTrack::new(Uuid::new_v4(), Arc::new(vec![0.5f32; 200]), rate);
        let mut mixer = AudioMixer::new(rate);
        mixer.add_track(a);
        mixer.add_track(b);
        mixer.seek(0.5);
        let out = mixer.mix(0.5, 4);
        for s in out {
            assert!((s - 0.75).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fade_in_ramp() {
        let rate = 100u32;
        let mut item = TimelineItem::new(ItemKind::Audio, "a", 0.0, 2.0);
        item.fade_in = Some(1.0);
        let track = AudioTrack::from_item(&item, Arc::new(vec![1.0f32; 400]), rate);
        let mut mixer = AudioMixer::new(rate);
        mixer.add_track(track);

        mixer.seek(0.5);
        let mid_fade = mixer.mix(0.5, 1)[0];
        assert!((mid_fade - 0.5).abs() < 0.02);

        mixer.seek(1.5);
        let past_fade = mixer.mix(1.5, 1)[0];
        assert!((past_fade - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_drift_triggers_reseek() {
        let rate = 1000u32;
        let track = AudioTrack::new(Uuid::new_v4(), ramp_pcm(10.0, rate), rate);
        let mut mixer = AudioMixer::new(rate);
        mixer.add_track(track);

        mixer.seek(0.0);
        mixer.mix(0.0, 10);
        // Jump the master clock without an explicit seek; the cursor is far
        // behind and must be snapped to the mapped position
        let out = mixer.mix(5.0, 1);
        assert!((out[0] - 5000.0).abs() < 2.0);
    }

    #[test]
    fn test_transport_is_uniform() {
        let mut mixer = AudioMixer::new(100);
        mixer.add_track(AudioTrack::new(Uuid::new_v4(), ramp_pcm(1.0, 100), 100));
        mixer.add_track(AudioTrack::new(Uuid::new_v4(), ramp_pcm(1.0, 100), 100));
        assert!(!mixer.is_playing());
        mixer.play();
        assert!(mixer.is_playing());
        mixer.seek(0.25);
        for track in &mixer.tracks {
            assert!((track.cursor - 0.25).abs() < 1e-9);
        }
        mixer.pause();
        assert!(!mixer.is_playing());
    }
}
