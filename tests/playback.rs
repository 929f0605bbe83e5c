//! End-to-end playback scenarios through the public crate surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use playhead::capability::Tier;
use playhead::decode::DecodeTuning;
use playhead::demux::RvfWriter;
use playhead::engine::{Engine, EngineConfig};
use playhead::timeline::{ItemKind, TimelineItem, Transition, TransitionKind};

/// 10 s stream at 5 fps, keyframe every 2 s. Frame i is an opaque solid
/// fill of shade i*5, so any output pixel identifies the frame it came from.
fn shade_stream(width: u32, height: u32) -> Arc<Vec<u8>> {
    let mut w = RvfWriter::new(width, height, 5.0);
    for i in 0..50u32 {
        let shade = (i * 5) as u8;
        let mut pixels = vec![shade; (width * height * 4) as usize];
        for px in pixels.chunks_exact_mut(4) {
            px[3] = 255;
        }
        w.add_frame(&pixels, i % 10 == 0).unwrap();
    }
    Arc::new(w.finish())
}

fn engine(width: usize, height: usize, audio_rate: u32) -> Engine {
    Engine::new(EngineConfig {
        width,
        height,
        audio_rate,
        audio_block: 8,
        tuning: DecodeTuning::default(),
        cache_limit: Some(64 * 1024 * 1024),
        tier: Some(Tier::Baseline),
    })
}

/// Tick until `check` on the composited frame's first pixel passes.
fn wait_for_pixel(engine: &mut Engine, check: impl Fn(&[u8]) -> bool) -> Option<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let out = engine.tick();
        let px = out.video.pixels()[0..4].to_vec();
        if check(&px) {
            return Some(px);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

#[test]
fn video_item_renders_the_frame_at_the_playhead() {
    let mut eng = engine(4, 4, 48_000);
    let item = TimelineItem::new(ItemKind::Video, "mem", 0.0, 10.0);
    eng.provide_media_bytes(item.id, shade_stream(4, 4));
    eng.set_items(vec![item]);

    // Paused at 3.0 s: frame 15 has shade 75
    eng.seek(3.0);
    let px = wait_for_pixel(&mut eng, |px| px[0] == 75);
    assert_eq!(px.as_deref().map(|p| p[0]), Some(75));
}

/// A half-way cross-fade over the black canvas halves the layer's
/// contribution.
#[test]
fn crossfade_midpoint_halves_the_layer() {
    let mut eng = engine(4, 4, 48_000);
    let mut item = TimelineItem::new(ItemKind::Video, "mem", 4.0, 3.0);
    item.transition = Some(Transition {
        kind: TransitionKind::Crossfade,
        duration: 1.0,
    });
    eng.provide_media_bytes(item.id, shade_stream(4, 4));
    eng.set_items(vec![item]);

    // Master 4.5 s is item-local 0.5 s (frame 2, shade 10), fade progress 0.5
    eng.seek(4.5);
    let px = wait_for_pixel(&mut eng, |px| px[0] > 0).unwrap();
    assert!((px[0] as i32 - 5).abs() <= 1, "got {}", px[0]);
}

/// Mid-transition, an incoming layer over an outgoing one takes half of
/// each: outgoing at full opacity below, incoming faded to 0.5 on top.
#[test]
fn crossfade_between_two_video_layers_blends_both() {
    let mut eng = engine(4, 4, 48_000);
    let outgoing = TimelineItem::new(ItemKind::Video, "mem", 0.0, 6.0);
    let mut incoming = TimelineItem::new(ItemKind::Video, "mem", 4.0, 6.0);
    incoming.z_index = Some(1);
    incoming.transition = Some(Transition {
        kind: TransitionKind::Crossfade,
        duration: 1.0,
    });
    eng.provide_media_bytes(outgoing.id, shade_stream(4, 4));
    eng.provide_media_bytes(incoming.id, shade_stream(4, 4));
    eng.set_items(vec![outgoing, incoming]);

    // Master 4.5 s: outgoing shows local 4.5 s (shade 110), incoming shows
    // local 0.5 s (shade 10) at fade progress 0.5. Src-over at alpha 0.5
    // leaves half of each: 10 * 0.5 + 110 * 0.5 = 60.
    eng.seek(4.5);
    let px = wait_for_pixel(&mut eng, |px| (px[0] as i32 - 60).abs() <= 2);
    assert!(px.is_some(), "blended pixel never reached ~60");
}

/// trim={2,8} and speed=2 map master 1.0 s to source 4.0 s for audio.
#[test]
fn audio_trim_speed_mapping_through_engine() {
    let rate = 1000u32;
    let mut eng = engine(2, 2, rate);
    let mut item = TimelineItem::new(ItemKind::Audio, "a", 0.0, 3.0);
    item.trim = Some(playhead::timeline::Trim { start: 2.0, end: 8.0 });
    item.speed = Some(2.0);
    let id = item.id;
    eng.set_items(vec![item]);

    let pcm: Arc<Vec<f32>> = Arc::new((0..10 * rate).map(|i| i as f32).collect());
    eng.attach_audio(id, pcm, rate);

    eng.seek(1.0);
    eng.play();
    let out = eng.tick();
    assert!(
        (out.audio[0] - 4000.0).abs() < 4.0,
        "first sample {}",
        out.audio[0]
    );
}

/// Tearing an item down mid-flight silences it without touching the other
/// source.
#[test]
fn removing_one_item_leaves_the_other_playing() {
    let mut eng = engine(4, 4, 48_000);
    let a = TimelineItem::new(ItemKind::Video, "mem", 0.0, 10.0);
    let b = TimelineItem::new(ItemKind::Video, "mem", 0.0, 10.0);
    let b_id = b.id;
    eng.provide_media_bytes(a.id, shade_stream(4, 4));
    eng.provide_media_bytes(b.id, shade_stream(4, 4));
    eng.set_items(vec![a.clone(), b]);

    // Wait until at least one source delivered pixels
    wait_for_pixel(&mut eng, |px| px[0] > 0 || px[3] == 255);

    eng.seek(7.3);
    eng.set_items(vec![a]);
    assert!(!eng.is_loaded(b_id));

    // The surviving item still resolves frames at the new position
    let px = wait_for_pixel(&mut eng, |px| px[0] >= 180);
    assert!(px.is_some());
}
