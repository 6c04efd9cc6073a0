// benches/benchmarks.rs -- Per-stage and full-pipeline benchmarks.
//
//   cargo bench
//
// All inputs are synthetic 752×480 frames (EuRoC camera size): a gradient
// background with bright rectangles, shifted a few pixels per frame.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use pyramid_klt::corner::{Candidate, CornerDetector, Detector};
use pyramid_klt::feature::{FeaturePool, PyramidFeature};
use pyramid_klt::gradient::{GradientPyramid, SobelGradient};
use pyramid_klt::image::Image;
use pyramid_klt::klt::{KltConfig, LkMethod, PyramidKltTracker};
use pyramid_klt::pyramid::{ImagePyramid, PyramidUpdater};
use pyramid_klt::selector::{PyramidFeatureSelector, SelectorConfig};
use pyramid_klt::tracker::{KltPointTracker, PointTrackerConfig};

const W: usize = 752;
const H: usize = 480;
const SCALES: [usize; 4] = [1, 2, 2, 2];

// ============================================================
// Helpers
// ============================================================

/// Synthetic scene with texture (rectangles + gradients).
fn make_scene(w: usize, h: usize, dx: usize, dy: usize) -> Arc<Image<u8>> {
    let mut img = Image::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let sx = x + dx;
            let sy = y + dy;
            let base = ((sx * 200 / w) + (sy * 55 / h)) as u8;
            img.set(x, y, base);
        }
    }
    for rect in 0..6 {
        let rx = (50 + rect * 100 + dx) % w;
        let ry = (40 + (rect % 3) * 120 + dy) % h;
        let bright = 180u8.wrapping_add(rect as u8 * 10);
        for y in ry..(ry + 60).min(h) {
            for x in rx..(rx + 80).min(w) {
                img.set(x, y, bright);
            }
        }
    }
    Arc::new(img)
}

fn prepare(frame: &Arc<Image<u8>>) -> (ImagePyramid<u8>, GradientPyramid) {
    let mut pyr = ImagePyramid::with_scaling(W, H, true, &SCALES).unwrap();
    PyramidUpdater::new(W, H).update(frame, &mut pyr).unwrap();
    let mut grads = GradientPyramid::for_pyramid(&pyr);
    grads.update(&mut SobelGradient::default(), &pyr).unwrap();
    (pyr, grads)
}

fn detect(pyr: &ImagePyramid<u8>, grads: &GradientPyramid, max_count: usize) -> Vec<Candidate> {
    let mut out = Vec::new();
    CornerDetector::default().detect(pyr, grads, &[], 0.0, max_count, &mut out);
    out
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_pyramid(c: &mut Criterion) {
    let frame = make_scene(W, H, 0, 0);

    let mut group = c.benchmark_group("pyramid");
    for save_reference in [true, false] {
        let mut pyr = ImagePyramid::with_scaling(W, H, save_reference, &SCALES).unwrap();
        let mut updater = PyramidUpdater::new(W, H);
        let name = if save_reference { "update_alias" } else { "update_copy" };
        group.bench_function(name, |b| b.iter(|| updater.update(&frame, &mut pyr).unwrap()));
    }
    group.finish();
}

fn bench_gradient(c: &mut Criterion) {
    let (pyr, mut grads) = prepare(&make_scene(W, H, 0, 0));
    let mut sobel = SobelGradient::default();

    let mut group = c.benchmark_group("gradient");
    group.bench_function("sobel_4layer_752x480", |b| {
        b.iter(|| grads.update(&mut sobel, &pyr).unwrap())
    });
    group.finish();
}

fn bench_corner(c: &mut Criterion) {
    let (pyr, grads) = prepare(&make_scene(W, H, 0, 0));
    let mut det = CornerDetector::default();
    let mut out = Vec::new();

    let mut group = c.benchmark_group("corner");
    group.bench_function("shi_tomasi_752x480", |b| {
        b.iter(|| det.detect(&pyr, &grads, &[], 0.0, 200, &mut out))
    });
    group.finish();
}

fn bench_klt(c: &mut Criterion) {
    let (pyr1, grads1) = prepare(&make_scene(W, H, 0, 0));
    let (pyr2, grads2) = prepare(&make_scene(W, H, 3, 2));
    let candidates = detect(&pyr1, &grads1, 100);

    let mut group = c.benchmark_group("klt");
    for (label, method) in [
        ("FA", LkMethod::ForwardAdditive),
        ("IC", LkMethod::InverseCompositional),
    ] {
        let tracker = PyramidKltTracker::new(KltConfig {
            radius: 5,
            method,
            ..KltConfig::default()
        });
        let described: Vec<PyramidFeature> = candidates
            .iter()
            .filter_map(|cand| {
                let mut f = PyramidFeature::new(SCALES.len(), 5);
                f.set_position(cand.x, cand.y);
                tracker.set_description(&mut f, &pyr1, &grads1).then_some(f)
            })
            .collect();

        group.bench_function(
            BenchmarkId::new(label, format!("{}feat_4pyr", described.len())),
            |b| {
                b.iter(|| {
                    let mut features = described.clone();
                    for f in &mut features {
                        tracker.track(f, &pyr2, &grads2);
                    }
                    features
                })
            },
        );
    }
    group.finish();
}

fn bench_selector(c: &mut Criterion) {
    let (pyr, grads) = prepare(&make_scene(W, H, 0, 0));
    let klt = PyramidKltTracker::new(KltConfig::default());
    let mut selector = PyramidFeatureSelector::new(
        SelectorConfig {
            target_count: 150,
            ..SelectorConfig::default()
        },
        CornerDetector::default(),
        klt,
    );

    let mut group = c.benchmark_group("selector");
    group.bench_function("replenish_150", |b| {
        let mut pool = FeaturePool::new(150, SCALES.len(), 3);
        b.iter(|| {
            pool.deactivate_all();
            selector.compute(&mut pool, &pyr, &grads).unwrap()
        })
    });
    group.finish();
}

fn bench_tracker_synthetic(c: &mut Criterion) {
    let frames: Vec<Arc<Image<u8>>> = (0..10).map(|i| make_scene(W, H, i * 3, i * 2)).collect();

    let mut group = c.benchmark_group("tracker");
    for parallel in [false, true] {
        let config = PointTrackerConfig {
            parallel,
            ..PointTrackerConfig::default()
        };
        let name = if parallel { "synthetic_10frames_rayon" } else { "synthetic_10frames" };
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut tracker = KltPointTracker::new(
                    config.clone(),
                    W,
                    H,
                    SobelGradient::default(),
                    CornerDetector::default(),
                )
                .unwrap();
                for frame in &frames {
                    tracker.process(frame).unwrap();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_pyramid,
    bench_gradient,
    bench_corner,
    bench_klt,
    bench_selector,
    bench_tracker_synthetic,
);
criterion_main!(benches);
