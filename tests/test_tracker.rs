// tests/test_tracker.rs — Integration tests for the frame-by-frame point tracker.

use std::collections::HashMap;
use std::sync::Arc;

use pyramid_klt::corner::{CornerDetector, CornerDetectorConfig};
use pyramid_klt::gradient::SobelGradient;
use pyramid_klt::image::Image;
use pyramid_klt::pyramid::PyramidConfig;
use pyramid_klt::selector::SelectorConfig;
use pyramid_klt::tracker::{KltPointTracker, PointTrackerConfig};
use pyramid_klt::KltError;

const W: usize = 120;
const H: usize = 90;

type Tracker = KltPointTracker<u8, SobelGradient, CornerDetector>;

/// Smooth texture translated by (tx, ty).
fn frame(tx: f32, ty: f32) -> Arc<Image<u8>> {
    Arc::new(Image::from_fn(W, H, |x, y| {
        let fx = x as f32 - tx;
        let fy = y as f32 - ty;
        let v = 128.0
            + 50.0 * (0.12 * fx + 0.05 * fy).sin()
            + 40.0 * (0.09 * fy - 0.04 * fx).cos()
            + 20.0 * (0.31 * fx).sin() * (0.27 * fy).cos();
        v.clamp(0.0, 255.0).round() as u8
    }))
}

fn config() -> PointTrackerConfig {
    PointTrackerConfig {
        pyramid: PyramidConfig {
            scale_factors: vec![1, 2, 2],
            ..PyramidConfig::default()
        },
        selector: SelectorConfig {
            target_count: 30,
            exclude_radius: 4.0,
        },
        ..PointTrackerConfig::default()
    }
}

fn tracker(config: PointTrackerConfig) -> Tracker {
    // Same radius as the KLT window, so every candidate can be described.
    let detector = CornerDetector::new(CornerDetectorConfig {
        radius: 3,
        threshold: 20.0,
        nms_radius: 5.0,
        ..CornerDetectorConfig::default()
    });
    KltPointTracker::new(config, W, H, SobelGradient::default(), detector).unwrap()
}

fn positions(t: &Tracker) -> HashMap<u64, (f32, f32)> {
    t.active_tracks().map(|v| (v.id, (v.x, v.y))).collect()
}

// ===== Frame loop =====

#[test]
fn ids_stay_attached_to_moving_points() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut t = tracker(config());

    let first = t.process(&frame(0.0, 0.0)).unwrap();
    assert_eq!(first.tracked, 0);
    assert!(first.spawned > 0, "no features on the first frame");
    let mut last = positions(&t);

    for i in 1..5 {
        let (tx, ty) = (i as f32, 0.5 * i as f32);
        let stats = t.process(&frame(tx, ty)).unwrap();
        assert_eq!(stats.tracked + stats.dropped, last.len(), "frame {i}");
        assert!(stats.tracked * 2 >= last.len(), "frame {i}: lost too many tracks");

        let now = positions(&t);
        for (id, &(px, py)) in &last {
            if let Some(&(x, y)) = now.get(id) {
                assert!(
                    (x - px - 1.0).abs() < 0.5 && (y - py - 0.5).abs() < 0.5,
                    "frame {i}: track {id} went from ({px}, {py}) to ({x}, {y})"
                );
            }
        }
        last = now;
    }
}

#[test]
fn lost_tracks_are_replenished_with_new_ids() {
    let mut t = tracker(config());
    t.process(&frame(0.0, 0.0)).unwrap();
    let n = t.active_tracks().count();
    assert!(n >= 3);

    let victims: Vec<u64> = t.active_tracks().take(3).map(|v| v.id).collect();
    for &id in &victims {
        assert!(t.drop_track(id));
    }
    let issued = t.total_tracks();

    let stats = t.process(&frame(0.0, 0.0)).unwrap();
    assert_eq!(stats.tracked, n - 3, "zero motion must keep every remaining track");
    assert!(stats.spawned > 0, "freed area should be re-detected");
    assert!(t.spawned_tracks().iter().all(|v| v.id >= issued));
    assert_eq!(stats.total, t.active_tracks().count());
    assert_eq!(t.pool().active().len() + t.pool().available().len(), 30);
}

#[test]
fn drop_all_tracks_empties_the_active_set() {
    let mut t = tracker(config());
    t.process(&frame(0.0, 0.0)).unwrap();
    t.drop_all_tracks();
    assert_eq!(t.active_tracks().count(), 0);
    assert!(t.dropped_tracks().is_empty());

    let issued = t.total_tracks();
    let stats = t.process(&frame(0.0, 0.0)).unwrap();
    assert_eq!(stats.tracked, 0);
    assert!(t.spawned_tracks().iter().all(|v| v.id >= issued));
}

#[test]
fn manual_tracks_without_auto_spawn() {
    let mut t = tracker(PointTrackerConfig {
        auto_spawn: false,
        ..config()
    });
    t.process(&frame(0.0, 0.0)).unwrap();
    assert_eq!(t.active_tracks().count(), 0);

    let id = t.add_track(60.0, 45.0).expect("interior point");
    let stats = t.process(&frame(1.0, 0.0)).unwrap();
    assert_eq!(stats.spawned, 0);
    assert_eq!(stats.tracked, 1);
    let view = t.active_tracks().next().unwrap();
    assert_eq!(view.id, id);
    assert!((view.x - 61.0).abs() < 0.3 && (view.y - 45.0).abs() < 0.3);
}

#[test]
fn parallel_tracking_matches_serial() {
    let mut serial = tracker(config());
    let mut parallel = tracker(PointTrackerConfig {
        parallel: true,
        ..config()
    });
    for i in 0..4 {
        let f = frame(0.8 * i as f32, -0.4 * i as f32);
        let a = serial.process(&f).unwrap();
        let b = parallel.process(&f).unwrap();
        assert_eq!(a, b, "frame {i}");
    }
    assert_eq!(positions(&serial), positions(&parallel));
}

#[test]
fn wrong_frame_size_is_an_error() {
    let mut t = tracker(config());
    let small = Arc::new(Image::<u8>::new(W / 2, H));
    assert!(matches!(t.process(&small), Err(KltError::ShapeMismatch { .. })));
}

// ===== Forward-backward validation =====

#[test]
fn forward_backward_keeps_consistent_tracks() {
    let mut t = tracker(PointTrackerConfig {
        forward_backward_tolerance: Some(1.0),
        ..config()
    });
    t.process(&frame(0.0, 0.0)).unwrap();
    let before = positions(&t);

    let stats = t.process(&frame(0.7, 0.4)).unwrap();
    assert!(stats.tracked * 2 >= before.len(), "{stats:?}");
    let after = positions(&t);
    for (id, &(x, y)) in &after {
        if let Some(&(px, py)) = before.get(id) {
            assert!((x - px - 0.7).abs() < 0.5 && (y - py - 0.4).abs() < 0.5);
        }
    }
}

#[test]
fn forward_backward_with_tiny_tolerance_drops_everything() {
    let mut t = tracker(PointTrackerConfig {
        forward_backward_tolerance: Some(1e-6),
        auto_spawn: true,
        ..config()
    });
    t.process(&frame(0.0, 0.0)).unwrap();
    let n = t.active_tracks().count();
    assert!(n > 0);

    let stats = t.process(&frame(0.37, 0.21)).unwrap();
    assert_eq!(stats.tracked, 0);
    assert_eq!(stats.dropped, n);
    assert_eq!(t.dropped_tracks().len(), n);
}
