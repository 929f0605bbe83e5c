//! Decode orchestrator: owns the decode threads and the message protocol.
//!
//! **Why**: the render loop must never block on a decoder. All decoding runs
//! on worker threads behind channels; requests go one way, events (frames,
//! state changes, errors) come back. One request in flight per source: a
//! request that arrives while another is still pending replaces nothing and
//! queues nothing, it is dropped. Dedicated threads enforce this with a
//! bounded slot, the shared thread with a per-source pending counter capped
//! at the same depth (one running plus one waiting). During scrubbing only
//! the latest position matters.
//!
//! Threading has two shapes, picked by the pipeline strategy: one named
//! thread per source, or every engine on a single shared decode thread.
//!
//! **Used by**: Engine (requests in, event pump out).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, trace, warn};
use uuid::Uuid;

use super::backend::{DecodeBackend, ReferenceDecoder};
use super::engine::{DecodeEngine, DecodeTuning, EngineError};
use crate::cache_man::Generation;
use crate::frame::FrameHandle;
use crate::timeline::{ItemKind, TimelineItem};

/// Where a source's container bytes come from.
#[derive(Debug, Clone)]
pub enum SourceLocator {
    Path(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

/// Requests into the orchestrator.
#[derive(Debug, Clone)]
pub enum SourceRequest {
    Load { id: Uuid, locator: SourceLocator },
    Seek { id: Uuid, target_us: i64 },
    BufferAhead { master_us: i64, items: Vec<TimelineItem> },
    Reset { id: Uuid },
    Destroy { id: Uuid },
}

/// Events out of the decode threads.
///
/// `Frame` carries a move-only handle plus the generation it was decoded
/// under; the pump discards stale generations before touching the cache.
#[derive(Debug)]
pub enum SourceEvent {
    Loading {
        id: Uuid,
        progress: f32,
    },
    Loaded {
        id: Uuid,
        duration_us: i64,
        width: u32,
        height: u32,
        frame_rate: f64,
    },
    Frame {
        id: Uuid,
        generation: u64,
        handle: FrameHandle,
    },
    Seeked {
        id: Uuid,
        target_us: i64,
        success: bool,
        error: Option<String>,
    },
    Error {
        id: Uuid,
        message: String,
    },
    Destroyed {
        id: Uuid,
    },
}

/// Produces a fresh backend per source. Supplied by the pipeline strategy.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn DecodeBackend> + Send + Sync>;

#[derive(Clone)]
pub struct OrchestratorConfig {
    /// One thread per source when true; one shared decode thread otherwise.
    pub dedicated_threads: bool,
    pub backend_factory: BackendFactory,
    pub tuning: DecodeTuning,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dedicated_threads: true,
            backend_factory: Arc::new(|| Box::new(ReferenceDecoder::new())),
            tuning: DecodeTuning::default(),
        }
    }
}

enum WorkKind {
    Load(SourceLocator),
    DecodeTo { target_us: i64, emit_seeked: bool },
    Reset,
    /// Shared-thread mode only; dedicated threads stop via their alive flag.
    Destroy,
}

struct Work {
    id: Uuid,
    /// Generation this request was issued under.
    issued_gen: u64,
    kind: WorkKind,
}

/// Envelope for the shared decode thread; carries the source's pending
/// counter so the thread can release the slot once the work is done (or
/// skipped).
struct SharedWork {
    work: Work,
    pending: Option<Arc<AtomicUsize>>,
}

/// Per-source bookkeeping on the orchestrator side.
struct SourceSlot {
    work_tx: Sender<Work>,
    generation: Generation,
    alive: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Shared-thread bookkeeping. `pending` counts this source's requests in
/// the shared queue plus the one being run; at the cap, `offer` drops.
struct SharedSlot {
    generation: Generation,
    pending: Arc<AtomicUsize>,
}

/// One running plus one waiting, same depth as the dedicated bounded slot.
const SHARED_PENDING_CAP: usize = 2;

pub struct Orchestrator {
    config: OrchestratorConfig,
    events: Sender<SourceEvent>,
    sources: HashMap<Uuid, SourceSlot>,
    /// Shared decode thread, lazily started (non-dedicated mode).
    shared_tx: Option<Sender<SharedWork>>,
    shared_handle: Option<thread::JoinHandle<()>>,
    shared_slots: HashMap<Uuid, SharedSlot>,
    next_thread_id: usize,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, events: Sender<SourceEvent>) -> Self {
        Self {
            config,
            events,
            sources: HashMap::new(),
            shared_tx: None,
            shared_handle: None,
            shared_slots: HashMap::new(),
            next_thread_id: 0,
        }
    }

    /// Convenience channel pair for consumers of `SourceEvent`s.
    pub fn event_channel() -> (Sender<SourceEvent>, Receiver<SourceEvent>) {
        unbounded()
    }

    /// Single protocol entry point.
    pub fn submit(&mut self, request: SourceRequest) {
        match request {
            SourceRequest::Load { id, locator } => self.load(id, locator),
            SourceRequest::Seek { id, target_us } => self.seek(id, target_us),
            SourceRequest::BufferAhead { master_us, items } => {
                self.buffer_ahead(master_us, &items)
            }
            SourceRequest::Reset { id } => self.reset(id),
            SourceRequest::Destroy { id } => self.destroy(id),
        }
    }

    /// Register a source and start loading it.
    pub fn load(&mut self, id: Uuid, locator: SourceLocator) {
        if self.sources.contains_key(&id) || self.shared_slots.contains_key(&id) {
            warn!("load ignored: source {} already exists", id);
            return;
        }
        if self.config.dedicated_threads {
            let slot = self.spawn_source_thread(id);
            let issued_gen = slot.generation.current();
            // Load is the slot's first message; the channel is empty, and a
            // blocking send keeps it from ever being dropped.
            let _ = slot.work_tx.send(Work {
                id,
                issued_gen,
                kind: WorkKind::Load(locator),
            });
            self.sources.insert(id, slot);
        } else {
            // The load itself occupies the slot while it runs
            let slot = SharedSlot {
                generation: Generation::new(),
                pending: Arc::new(AtomicUsize::new(1)),
            };
            let issued_gen = slot.generation.current();
            let pending = Some(Arc::clone(&slot.pending));
            self.shared_slots.insert(id, slot);
            self.shared_send(
                Work {
                    id,
                    issued_gen,
                    kind: WorkKind::Load(locator),
                },
                pending,
            );
        }
    }

    /// Random access: bump the generation so in-flight results go stale, then
    /// offer the request to the slot. A full slot drops the request.
    pub fn seek(&mut self, id: Uuid, target_us: i64) {
        let Some(generation) = self.generation_of(id) else {
            warn!("seek ignored: unknown source {}", id);
            return;
        };
        let issued_gen = generation.bump();
        self.offer(Work {
            id,
            issued_gen,
            kind: WorkKind::DecodeTo {
                target_us,
                emit_seeked: true,
            },
        });
    }

    /// Fan out decode-ahead work to every video item active around
    /// `master_us`. Does not bump generations; stale-dropping only applies to
    /// position changes.
    pub fn buffer_ahead(&mut self, master_us: i64, items: &[TimelineItem]) {
        let t = master_us as f64 / 1_000_000.0;
        let horizon = self.config.tuning.buffer_ahead_us as f64 / 1_000_000.0;
        for item in items {
            if item.kind != ItemKind::Video {
                continue;
            }
            let (start, end) = item.window();
            // Active now, or starting within the look-ahead horizon
            if t < start - horizon || t >= end {
                continue;
            }
            let Some(generation) = self.generation_of(item.id) else {
                continue;
            };
            let local_us = (item.local_time(t.max(start)) * 1_000_000.0).round() as i64;
            let issued_gen = generation.current();
            self.offer(Work {
                id: item.id,
                issued_gen,
                kind: WorkKind::DecodeTo {
                    target_us: local_us,
                    emit_seeked: false,
                },
            });
        }
    }

    /// Drop the source's decoder context; the source stays loaded.
    pub fn reset(&mut self, id: Uuid) {
        let Some(generation) = self.generation_of(id) else {
            warn!("reset ignored: unknown source {}", id);
            return;
        };
        let issued_gen = generation.bump();
        self.offer(Work {
            id,
            issued_gen,
            kind: WorkKind::Reset,
        });
    }

    /// Tear the source down. Pending work goes stale immediately; the decode
    /// thread emits `Destroyed` once the engine is gone.
    pub fn destroy(&mut self, id: Uuid) {
        if let Some(mut slot) = self.sources.remove(&id) {
            slot.generation.bump();
            slot.alive.store(false, Ordering::SeqCst);
            // Joining here would stall the caller; the thread exits on its
            // own after noticing the flag.
            slot.handle.take();
            debug!("destroy signalled for source {}", id);
        } else if let Some(slot) = self.shared_slots.remove(&id) {
            let issued_gen = slot.generation.bump();
            // Destroy bypasses the pending cap; it must never be dropped
            self.shared_send(
                Work {
                    id,
                    issued_gen,
                    kind: WorkKind::Destroy,
                },
                None,
            );
        } else {
            warn!("destroy ignored: unknown source {}", id);
        }
    }

    pub fn has_source(&self, id: Uuid) -> bool {
        self.sources.contains_key(&id) || self.shared_slots.contains_key(&id)
    }

    /// Current generation of a source, for validating `Frame` events.
    pub fn current_generation(&self, id: Uuid) -> Option<u64> {
        self.generation_of(id).map(|g| g.current())
    }

    fn generation_of(&self, id: Uuid) -> Option<Generation> {
        self.sources
            .get(&id)
            .map(|s| s.generation.clone())
            .or_else(|| self.shared_slots.get(&id).map(|s| s.generation.clone()))
    }

    /// Hand the request to its source's slot; drop it when the slot is
    /// occupied. That is the protocol: one request in flight, the rest
    /// discarded.
    fn offer(&mut self, work: Work) {
        if self.config.dedicated_threads {
            if let Some(slot) = self.sources.get(&work.id) {
                match slot.work_tx.try_send(work) {
                    Ok(()) => {}
                    Err(TrySendError::Full(w)) => {
                        trace!("request dropped for {} (slot busy)", w.id);
                    }
                    Err(TrySendError::Disconnected(w)) => {
                        warn!("request dropped for {} (thread gone)", w.id);
                    }
                }
            }
        } else {
            let Some(slot) = self.shared_slots.get(&work.id) else {
                return;
            };
            let accepted = slot
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < SHARED_PENDING_CAP).then_some(n + 1)
                })
                .is_ok();
            if !accepted {
                trace!("request dropped for {} (slot busy)", work.id);
                return;
            }
            let pending = Some(Arc::clone(&slot.pending));
            self.shared_send(work, pending);
        }
    }

    fn shared_send(&mut self, work: Work, pending: Option<Arc<AtomicUsize>>) {
        if self.shared_tx.is_none() {
            self.start_shared_thread();
        }
        match &self.shared_tx {
            Some(tx) => {
                if let Err(e) = tx.send(SharedWork { work, pending }) {
                    if let Some(counter) = &e.0.pending {
                        counter.fetch_sub(1, Ordering::SeqCst);
                    }
                    warn!("request dropped for {} (shared thread gone)", e.0.work.id);
                }
            }
            None => {
                if let Some(counter) = pending {
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn spawn_source_thread(&mut self, id: Uuid) -> SourceSlot {
        let (work_tx, work_rx) = bounded::<Work>(1);
        let generation = Generation::new();
        let alive = Arc::new(AtomicBool::new(true));

        let events = self.events.clone();
        let gen_handle = generation.clone();
        let alive_flag = Arc::clone(&alive);
        let backend = (self.config.backend_factory)();
        let tuning = self.config.tuning;
        let thread_id = self.next_thread_id;
        self.next_thread_id += 1;

        let handle = thread::Builder::new()
            .name(format!("playhead-decode-{}", thread_id))
            .spawn(move || {
                trace!("decode thread {} started for {}", thread_id, id);
                let mut engine = DecodeEngine::new(backend, tuning);
                loop {
                    if !alive_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match work_rx.recv_timeout(Duration::from_millis(20)) {
                        Ok(work) => {
                            run_work(&mut engine, &gen_handle, &events, work);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                engine.destroy();
                let _ = events.send(SourceEvent::Destroyed { id });
                trace!("decode thread {} stopped", thread_id);
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("failed to spawn decode thread: {}", e);
                None
            }
        };

        SourceSlot {
            work_tx,
            generation,
            alive,
            handle,
        }
    }

    fn start_shared_thread(&mut self) {
        let (tx, rx) = unbounded::<SharedWork>();
        let events = self.events.clone();
        let backend_factory = Arc::clone(&self.config.backend_factory);
        let tuning = self.config.tuning;
        let generations: HashMap<Uuid, Generation> = HashMap::new();

        let handle = thread::Builder::new()
            .name("playhead-decode-shared".to_string())
            .spawn(move || {
                info!("shared decode thread started");
                let mut engines: HashMap<Uuid, DecodeEngine> = HashMap::new();
                let mut generations = generations;
                while let Ok(SharedWork { work, pending }) = rx.recv() {
                    match work.kind {
                        WorkKind::Destroy => {
                            if let Some(mut engine) = engines.remove(&work.id) {
                                engine.destroy();
                            }
                            generations.remove(&work.id);
                            let _ = events.send(SourceEvent::Destroyed { id: work.id });
                        }
                        _ => {
                            let engine = engines.entry(work.id).or_insert_with(|| {
                                DecodeEngine::new(backend_factory(), tuning)
                            });
                            let gen_handle = generations
                                .entry(work.id)
                                .or_insert_with(Generation::new)
                                .clone();
                            // Shared-mode staleness: skip work superseded by a
                            // later request for the same source
                            if work.issued_gen < gen_handle.current() {
                                trace!("stale work skipped for {}", work.id);
                            } else {
                                // Sync the thread-local generation to the tag
                                // so frame events validate against it
                                while gen_handle.current() < work.issued_gen {
                                    gen_handle.bump();
                                }
                                run_work(engine, &gen_handle, &events, work);
                            }
                        }
                    }
                    if let Some(counter) = pending {
                        counter.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                info!("shared decode thread stopped");
            });

        match handle {
            Ok(h) => {
                self.shared_tx = Some(tx);
                self.shared_handle = Some(h);
            }
            Err(e) => warn!("failed to spawn shared decode thread: {}", e),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for slot in self.sources.values() {
            slot.alive.store(false, Ordering::SeqCst);
        }
        self.shared_tx = None; // closes the shared channel

        // Bounded wait, the process may be exiting
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        let handles: Vec<_> = self
            .sources
            .values_mut()
            .filter_map(|s| s.handle.take())
            .chain(self.shared_handle.take())
            .collect();
        for handle in handles {
            while !handle.is_finished() {
                if std::time::Instant::now() >= deadline {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }
}

/// Execute one work item on a decode thread, emitting protocol events.
/// Results tagged with a stale generation are discarded, never sent.
fn run_work(
    engine: &mut DecodeEngine,
    generation: &Generation,
    events: &Sender<SourceEvent>,
    work: Work,
) {
    let id = work.id;
    match work.kind {
        WorkKind::Load(locator) => {
            let _ = events.send(SourceEvent::Loading { id, progress: 0.0 });
            let bytes = match read_locator(&locator) {
                Ok(bytes) => bytes,
                Err(message) => {
                    let _ = events.send(SourceEvent::Error { id, message });
                    return;
                }
            };
            let _ = events.send(SourceEvent::Loading { id, progress: 0.5 });
            match engine.load(&bytes) {
                Ok((pts, preview)) => {
                    let info = match engine.info() {
                        Some(info) => info,
                        None => return,
                    };
                    let _ = events.send(SourceEvent::Loaded {
                        id,
                        duration_us: info.duration_us,
                        width: info.width,
                        height: info.height,
                        frame_rate: info.frame_rate,
                    });
                    if generation.is_current(work.issued_gen) {
                        let _ = events.send(SourceEvent::Frame {
                            id,
                            generation: work.issued_gen,
                            handle: FrameHandle::new(pts, preview),
                        });
                    }
                }
                Err(e) => {
                    let _ = events.send(SourceEvent::Error {
                        id,
                        message: e.to_string(),
                    });
                }
            }
        }
        WorkKind::DecodeTo {
            target_us,
            emit_seeked,
        } => {
            match engine.decode_to(target_us) {
                Ok(frames) => {
                    // Re-checked per frame: a destroy or newer seek landing
                    // mid-batch cuts the flood off immediately
                    for (pts, frame) in frames {
                        if !generation.is_current(work.issued_gen) {
                            trace!("decoded batch discarded for {} (stale)", id);
                            break;
                        }
                        let _ = events.send(SourceEvent::Frame {
                            id,
                            generation: work.issued_gen,
                            handle: FrameHandle::new(pts, frame),
                        });
                    }
                    if emit_seeked && generation.is_current(work.issued_gen) {
                        let _ = events.send(SourceEvent::Seeked {
                            id,
                            target_us,
                            success: true,
                            error: None,
                        });
                    }
                }
                Err(e) => {
                    let fatal = matches!(
                        e,
                        EngineError::Decode(ref d) if d.is_fatal()
                    ) || matches!(e, EngineError::NotLoaded | EngineError::NoKeyframeFound);
                    if emit_seeked && generation.is_current(work.issued_gen) {
                        let _ = events.send(SourceEvent::Seeked {
                            id,
                            target_us,
                            success: false,
                            error: Some(e.to_string()),
                        });
                    }
                    if fatal {
                        let _ = events.send(SourceEvent::Error {
                            id,
                            message: e.to_string(),
                        });
                    } else {
                        debug!("transient decode failure for {}: {}", id, e);
                    }
                }
            }
        }
        WorkKind::Reset => {
            if let Err(e) = engine.reset() {
                let _ = events.send(SourceEvent::Error {
                    id,
                    message: e.to_string(),
                });
            }
        }
        WorkKind::Destroy => {
            // Dedicated threads never see this variant
            engine.destroy();
            let _ = events.send(SourceEvent::Destroyed { id });
        }
    }
}

fn read_locator(locator: &SourceLocator) -> Result<Vec<u8>, String> {
    match locator {
        SourceLocator::Path(path) => std::fs::read(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e)),
        SourceLocator::Bytes(bytes) => Ok(bytes.as_ref().clone()),
    }
}
