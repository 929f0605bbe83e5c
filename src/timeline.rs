//! Timeline item descriptors consumed from the surrounding editor.
//!
//! A `TimelineItem` is the authoritative arrangement datum: everything the
//! render tick derives (compositor layers, audio tracks, buffer-ahead fan-out)
//! is rebuilt from the current item list and never persisted.
//!
//! # Coordinate Systems
//!
//! - `start` - where the item begins on the MASTER timeline (seconds)
//! - `duration` - how long the item occupies the master timeline
//! - `trim` - sub-range of the SOURCE media that is played
//! - `speed` - playback rate (2.0 = source runs twice as fast)
//!
//! Mapping master time `t` into source-local time:
//! `local = trim.start + (t - start) * speed`

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Allowed playback speed range (matches what the editor UI exposes).
const SPEED_MIN: f64 = 0.1;
const SPEED_MAX: f64 = 4.0;

/// What kind of media an item references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Video,
    Image,
    Audio,
    Text,
}

/// Sub-range of the source media, in source-local seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trim {
    pub start: f64,
    pub end: f64,
}

/// Transition shape between adjacent layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Crossfade,
    WipeLeft,
    WipeRight,
}

/// Transition descriptor: blend runs over `duration` seconds from item start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub duration: f64,
}

/// One item placed on the master timeline.
///
/// Field names follow the editor's JSON descriptor (camelCase on the wire).
/// Optional fields default to neutral values; accessors apply the defaults
/// and clamps so downstream code never re-validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineItem {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Locator for video/image/audio sources; unused for text.
    pub url: String,
    /// Inline payload for text items.
    pub text: Option<String>,
    pub start_time: f64,
    pub duration: f64,
    pub trim: Option<Trim>,
    pub speed: Option<f64>,
    pub volume: Option<f64>,
    pub opacity: Option<f64>,
    /// Top-left placement on the output canvas, pixels.
    pub position: Option<(i32, i32)>,
    pub z_index: Option<i32>,
    pub transition: Option<Transition>,
    /// Audio fade ramp lengths, seconds.
    pub fade_in: Option<f64>,
    pub fade_out: Option<f64>,
}

impl Default for TimelineItem {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            kind: ItemKind::Video,
            url: String::new(),
            text: None,
            start_time: 0.0,
            duration: 0.0,
            trim: None,
            speed: None,
            volume: None,
            opacity: None,
            position: None,
            z_index: None,
            transition: None,
            fade_in: None,
            fade_out: None,
        }
    }
}

impl TimelineItem {
    /// Minimal constructor used by tests and the probe tool.
    pub fn new(kind: ItemKind, url: impl Into<String>, start_time: f64, duration: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            url: url.into(),
            start_time,
            duration,
            ..Default::default()
        }
    }

    /// Master-timeline window (start, end).
    pub fn window(&self) -> (f64, f64) {
        (self.start_time, self.start_time + self.duration)
    }

    /// Whether master time `t` falls inside this item's window.
    pub fn active_at(&self, t: f64) -> bool {
        let (start, end) = self.window();
        t >= start && t < end
    }

    /// Playback speed with clamp applied.
    pub fn speed(&self) -> f64 {
        self.speed.unwrap_or(1.0).clamp(SPEED_MIN, SPEED_MAX)
    }

    /// Trim start in source-local seconds (0 when untrimmed).
    pub fn trim_start(&self) -> f64 {
        self.trim.map(|t| t.start).unwrap_or(0.0)
    }

    /// Trim end in source-local seconds, if any.
    pub fn trim_end(&self) -> Option<f64> {
        self.trim.map(|t| t.end)
    }

    /// Gain multiplier, clamped to [0, 1].
    pub fn volume(&self) -> f64 {
        self.volume.unwrap_or(1.0).clamp(0.0, 1.0)
    }

    /// Opacity, clamped to [0, 1].
    pub fn opacity(&self) -> f64 {
        self.opacity.unwrap_or(1.0).clamp(0.0, 1.0)
    }

    pub fn position(&self) -> (i32, i32) {
        self.position.unwrap_or((0, 0))
    }

    pub fn z_index(&self) -> i32 {
        self.z_index.unwrap_or(0)
    }

    /// Map master time into source-local seconds.
    ///
    /// The result is clamped to the trim window so a caller can never request
    /// decode outside the sub-range the editor selected.
    pub fn local_time(&self, t: f64) -> f64 {
        let local = self.trim_start() + (t - self.start_time) * self.speed();
        match self.trim_end() {
            Some(end) => local.clamp(self.trim_start(), end),
            None => local.max(self.trim_start()),
        }
    }

    /// Transition progress at master time `t`, clamped to [0, 1].
    /// Returns None when the item has no transition.
    pub fn transition_progress(&self, t: f64) -> Option<(TransitionKind, f64)> {
        let tr = self.transition?;
        if tr.duration <= 0.0 {
            return Some((tr.kind, 1.0));
        }
        let progress = ((t - self.start_time) / tr.duration).clamp(0.0, 1.0);
        Some((tr.kind, progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_and_active() {
        let item = TimelineItem::new(ItemKind::Video, "clip.mp4", 2.0, 5.0);
        assert_eq!(item.window(), (2.0, 7.0));
        assert!(item.active_at(2.0));
        assert!(item.active_at(6.999));
        assert!(!item.active_at(7.0));
        assert!(!item.active_at(1.5));
    }

    /// trim={start:2,end:8}, speed=2, start=0: master 1.0s maps to
    /// source 2 + 1.0*2 = 4.0s.
    #[test]
    fn test_local_time_mapping() {
        let mut item = TimelineItem::new(ItemKind::Audio, "a.wav", 0.0, 3.0);
        item.trim = Some(Trim { start: 2.0, end: 8.0 });
        item.speed = Some(2.0);
        assert!((item.local_time(1.0) - 4.0).abs() < 1e-9);
        // Clamped to trim window
        assert!((item.local_time(10.0) - 8.0).abs() < 1e-9);
        assert!((item.local_time(-1.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamps() {
        let mut item = TimelineItem::new(ItemKind::Video, "v.mp4", 0.0, 1.0);
        item.speed = Some(100.0);
        item.volume = Some(3.0);
        item.opacity = Some(-0.5);
        assert_eq!(item.speed(), 4.0);
        assert_eq!(item.volume(), 1.0);
        assert_eq!(item.opacity(), 0.0);
    }

    #[test]
    fn test_transition_progress() {
        let mut item = TimelineItem::new(ItemKind::Video, "v.mp4", 4.0, 3.0);
        item.transition = Some(Transition {
            kind: TransitionKind::Crossfade,
            duration: 1.0,
        });
        let (_, p) = item.transition_progress(4.5).unwrap();
        assert!((p - 0.5).abs() < 1e-9);
        let (_, p) = item.transition_progress(6.0).unwrap();
        assert_eq!(p, 1.0);
        let (_, p) = item.transition_progress(3.0).unwrap();
        assert_eq!(p, 0.0);
    }

    #[test]
    fn test_descriptor_json_round_trip() {
        let json = r#"{
            "id": "8f5c9d8e-3f65-4c2b-9f2d-5a4f0a3b1c2d",
            "type": "video",
            "url": "clips/intro.mp4",
            "startTime": 1.5,
            "duration": 4.0,
            "trim": { "start": 0.5, "end": 4.5 },
            "speed": 1.0,
            "opacity": 0.8,
            "zIndex": 2,
            "transition": { "kind": "crossfade", "duration": 1.0 }
        }"#;
        let item: TimelineItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.kind, ItemKind::Video);
        assert_eq!(item.z_index(), 2);
        assert!((item.opacity() - 0.8).abs() < 1e-9);
        assert_eq!(item.trim_start(), 0.5);
    }
}
