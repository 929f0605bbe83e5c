//! The public engine: timeline in, composited frames and mixed audio out.
//!
//! **Why**: embedders deal with one object. `set_items` declares the
//! arrangement, the transport trio (`play`/`pause`/`seek`) drives the master
//! clock, and `tick()` does one unit of work: pump decode events into the
//! caches, request buffer-ahead, composite the current video frame and mix
//! the current audio block. A tick never blocks on decoding; missing frames
//! render as skipped layers and appear on a later tick.
//!
//! Per-source failures stay per-source: an errored item renders empty while
//! every other item keeps playing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{AudioMixer, AudioTrack};
use crate::cache::CacheSet;
use crate::cache_man::CacheManager;
use crate::capability::{select_strategy, strategy_for_tier, Capabilities, Tier};
use crate::clock::PlaybackClock;
use crate::compositor::{Compositor, CompositorLayer};
use crate::decode::{DecodeTuning, Orchestrator, SourceEvent, SourceLocator};
use crate::frame::Frame;
use crate::text::{self, TextStyle};
use crate::timeline::{ItemKind, TimelineItem};

/// Engine construction parameters.
#[derive(Clone)]
pub struct EngineConfig {
    /// Output canvas resolution.
    pub width: usize,
    pub height: usize,
    /// Master audio sample rate.
    pub audio_rate: u32,
    /// Audio samples produced per tick.
    pub audio_block: usize,
    pub tuning: DecodeTuning,
    /// Fixed cache limit in bytes; `None` derives one from system memory.
    pub cache_limit: Option<usize>,
    /// Pin a decode tier instead of detecting capabilities.
    pub tier: Option<Tier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            audio_rate: 48_000,
            audio_block: 800,
            tuning: DecodeTuning::default(),
            cache_limit: None,
            tier: None,
        }
    }
}

/// One tick's worth of output.
pub struct RenderOutput {
    pub video: Frame,
    /// Mono master mix, `audio_block` samples. All zeros while paused.
    pub audio: Vec<f32>,
}

/// Metadata kept per loaded video source.
#[derive(Debug, Clone, Copy)]
struct SourceMeta {
    duration_us: i64,
}

pub struct Engine {
    config: EngineConfig,
    clock: PlaybackClock,
    orchestrator: Orchestrator,
    events: Receiver<SourceEvent>,
    caches: CacheSet,
    compositor: Compositor,
    mixer: AudioMixer,
    items: Vec<TimelineItem>,
    /// Rasterized text and decoded still images, keyed by item id.
    statics: HashMap<Uuid, Frame>,
    /// Decoded PCM supplied by the embedder for audio items.
    audio_pcm: HashMap<Uuid, (Arc<Vec<f32>>, u32)>,
    /// In-memory media bytes taking precedence over the item's url.
    media_bytes: HashMap<Uuid, Arc<Vec<u8>>>,
    loaded: HashMap<Uuid, SourceMeta>,
    errored: HashSet<Uuid>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let strategy = match config.tier {
            Some(tier) => strategy_for_tier(tier),
            None => select_strategy(Capabilities::detect()),
        };
        let manager = Arc::new(match config.cache_limit {
            Some(limit) => CacheManager::with_limit(limit),
            None => CacheManager::new(0.5, 2.0),
        });
        let (events_tx, events_rx) = Orchestrator::event_channel();
        let orchestrator = Orchestrator::new(strategy.orchestrator_config(config.tuning), events_tx);
        info!(
            "engine up: {}x{} @{} Hz audio, strategy={}",
            config.width, config.height, config.audio_rate, strategy.name()
        );

        Self {
            compositor: Compositor::new(config.width, config.height),
            mixer: AudioMixer::new(config.audio_rate),
            clock: PlaybackClock::new(),
            orchestrator,
            events: events_rx,
            caches: CacheSet::new(manager),
            items: Vec::new(),
            statics: HashMap::new(),
            audio_pcm: HashMap::new(),
            media_bytes: HashMap::new(),
            loaded: HashMap::new(),
            errored: HashSet::new(),
            config,
        }
    }

    /// Provide container bytes for an item id ahead of `set_items`, instead
    /// of reading the item's url from disk.
    pub fn provide_media_bytes(&mut self, id: Uuid, bytes: Arc<Vec<u8>>) {
        self.media_bytes.insert(id, bytes);
    }

    /// Provide decoded mono PCM for an audio item.
    pub fn attach_audio(&mut self, id: Uuid, pcm: Arc<Vec<f32>>, sample_rate: u32) {
        self.audio_pcm.insert(id, (pcm, sample_rate));
        if let Some(item) = self.items.iter().find(|i| i.id == id && i.kind == ItemKind::Audio) {
            let item = item.clone();
            self.rebuild_audio_track(&item);
        }
    }

    /// Declare the current arrangement. Sources are diffed by item id: new
    /// video items start loading, removed items are destroyed and their
    /// caches freed.
    pub fn set_items(&mut self, items: Vec<TimelineItem>) {
        let new_ids: HashSet<Uuid> = items.iter().map(|i| i.id).collect();

        // Tear down removed items
        let old_items = std::mem::take(&mut self.items);
        for item in &old_items {
            if !new_ids.contains(&item.id) {
                match item.kind {
                    ItemKind::Video => {
                        self.orchestrator.destroy(item.id);
                        self.caches.remove(item.id);
                    }
                    ItemKind::Audio => self.mixer.remove_track(item.id),
                    _ => {}
                }
                self.statics.remove(&item.id);
                self.loaded.remove(&item.id);
                self.errored.remove(&item.id);
            }
        }
        let old_ids: HashSet<Uuid> = old_items.iter().map(|i| i.id).collect();

        for item in &items {
            if old_ids.contains(&item.id) {
                continue;
            }
            match item.kind {
                ItemKind::Video => {
                    let locator = match self.media_bytes.get(&item.id) {
                        Some(bytes) => SourceLocator::Bytes(Arc::clone(bytes)),
                        None => SourceLocator::Path(PathBuf::from(&item.url)),
                    };
                    self.orchestrator.load(item.id, locator);
                }
                ItemKind::Image => match self.load_image(&item.url) {
                    Ok(frame) => {
                        self.statics.insert(item.id, frame);
                    }
                    Err(e) => {
                        warn!("image item {} failed: {}", item.id, e);
                        self.errored.insert(item.id);
                    }
                },
                ItemKind::Text => {
                    let content = item.text.clone().unwrap_or_default();
                    let frame = text::rasterize(&content, &TextStyle::default());
                    self.statics.insert(item.id, frame);
                }
                ItemKind::Audio => {
                    self.rebuild_audio_track(item);
                }
            }
        }

        self.items = items;
        self.mixer.seek(self.clock.current_seconds());
    }

    pub fn play(&mut self) {
        self.clock.play();
        self.mixer.play();
    }

    pub fn pause(&mut self) {
        self.clock.pause();
        self.mixer.pause();
    }

    /// Jump the master clock. Backward jumps invalidate each source's cache
    /// past the target so the redecode is keyframe-anchored, then the
    /// orchestrator is asked for the new positions. Works paused or playing;
    /// paused seeks resynchronize on the next tick.
    pub fn seek(&mut self, target: f64) {
        let target = target.max(0.0);
        let backward = target < self.clock.current_seconds();
        self.clock.seek_seconds(target);
        self.mixer.seek(target);

        let items = self.items.clone();
        for item in &items {
            if item.kind != ItemKind::Video || !self.orchestrator.has_source(item.id) {
                continue;
            }
            let local_us = (item.local_time(target) * 1_000_000.0).round() as i64;
            if backward {
                self.caches
                    .with_cache(item.id, |c| c.invalidate_after(local_us));
            }
            if item.active_at(target) || item.start_time >= target {
                self.orchestrator.seek(item.id, local_us);
            }
        }
        debug!("seek to {:.3}s (backward={})", target, backward);
    }

    pub fn current_time(&self) -> f64 {
        self.clock.current_seconds()
    }

    pub fn is_playing(&self) -> bool {
        self.clock.is_playing()
    }

    /// Whether a video item's source reported metadata yet.
    pub fn is_loaded(&self, id: Uuid) -> bool {
        self.loaded.contains_key(&id)
    }

    pub fn has_errored(&self, id: Uuid) -> bool {
        self.errored.contains(&id)
    }

    /// One render step: pump decode events, schedule buffer-ahead,
    /// composite and mix at the current master time.
    pub fn tick(&mut self) -> RenderOutput {
        let t_us = self.clock.tick();
        let t = t_us as f64 / 1_000_000.0;

        self.pump_events();

        if self.clock.is_playing() {
            let items = self.items.clone();
            self.orchestrator.buffer_ahead(t_us, &items);
        }

        let layers = self.build_layers(t);
        let video = self.compositor.composite(&layers);

        let audio = if self.clock.is_playing() {
            self.mixer.mix(t, self.config.audio_block)
        } else {
            vec![0.0; self.config.audio_block]
        };

        RenderOutput { video, audio }
    }

    /// Drain decode events into caches and bookkeeping. Frames tagged with a
    /// stale generation are dropped here, before they can touch a cache.
    fn pump_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                SourceEvent::Frame {
                    id,
                    generation,
                    handle,
                } => {
                    if self.orchestrator.current_generation(id) != Some(generation) {
                        debug!("stale frame for {} dropped", id);
                        continue;
                    }
                    let (pts, frame) = handle.into_frame();
                    let window = self.config.tuning.buffer_ahead_us;
                    self.caches.with_cache(id, |cache| {
                        cache.insert(pts, frame);
                        cache.retain_window(pts, window);
                    });
                }
                SourceEvent::Loaded {
                    id, duration_us, ..
                } => {
                    self.loaded.insert(id, SourceMeta { duration_us });
                    self.errored.remove(&id);
                }
                SourceEvent::Loading { id, progress } => {
                    debug!("source {} loading: {:.0}%", id, progress * 100.0);
                }
                SourceEvent::Seeked {
                    id,
                    target_us,
                    success,
                    error,
                } => {
                    if !success {
                        warn!(
                            "seek to {}us failed for {}: {}",
                            target_us,
                            id,
                            error.unwrap_or_default()
                        );
                    }
                }
                SourceEvent::Error { id, message } => {
                    warn!("source {} errored: {}", id, message);
                    self.errored.insert(id);
                }
                SourceEvent::Destroyed { id } => {
                    self.caches.remove(id);
                    self.loaded.remove(&id);
                }
            }
        }
    }

    /// Snapshot of drawable layers at master time `t`. Only video items go
    /// through the caches; images and text resolve from the static map.
    fn build_layers(&self, t: f64) -> Vec<CompositorLayer> {
        let mut layers = Vec::new();
        for item in &self.items {
            if item.kind == ItemKind::Audio || !item.active_at(t) {
                continue;
            }
            let frame = if self.errored.contains(&item.id) {
                None
            } else {
                match item.kind {
                    ItemKind::Video => {
                        let local_us = (item.local_time(t) * 1_000_000.0).round() as i64;
                        // Small epsilon absorbs f64 rounding at frame edges
                        self.caches
                            .nearest_at_or_before(item.id, local_us + 1_000)
                            .map(|(_, frame)| frame)
                    }
                    _ => self.statics.get(&item.id).cloned(),
                }
            };
            layers.push(CompositorLayer {
                frame,
                position: item.position(),
                z_index: item.z_index(),
                opacity: item.opacity() as f32,
                transition: item
                    .transition_progress(t)
                    .map(|(kind, p)| (kind, p as f32)),
            });
        }
        layers
    }

    fn rebuild_audio_track(&mut self, item: &TimelineItem) {
        self.mixer.remove_track(item.id);
        if let Some((pcm, rate)) = self.audio_pcm.get(&item.id) {
            let track = AudioTrack::from_item(item, Arc::clone(pcm), *rate);
            self.mixer.add_track(track);
        }
    }

    fn load_image(&self, url: &str) -> Result<Frame, String> {
        let img = image::open(url).map_err(|e| e.to_string())?;
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        Frame::from_rgba8(rgba.into_raw(), w as usize, h as usize).map_err(|e| e.to_string())
    }
}
