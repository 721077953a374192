use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{GrayImage, Luma};
use inktrace::{
    BlobConfig, BlobDetector, CaptureConfig, FrameSource, MotionSegmenter, PersistError,
    SegmenterConfig, SyntheticScene, SyntheticSource, TraceEngine, TraceId, TraceSink,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const W: u32 = 512;
const H: u32 = 424;

struct NullSink;

impl TraceSink for NullSink {
    fn persist(&mut self, _: GrayImage, _: TraceId, _: usize) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Dark frame with a few bright spots, thresholded the way the engine does.
fn make_frame(seed: u64, spots: usize) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::new(W, H);
    for _ in 0..spots {
        let cx = rng.gen_range(10.0f32..(W as f32 - 10.0));
        let cy = rng.gen_range(10.0f32..(H as f32 - 10.0));
        let r = rng.gen_range(2.0f32..5.0);
        for y in (cy - r) as u32..=(cy + r) as u32 {
            for x in (cx - r) as u32..=(cx + r) as u32 {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                if dx * dx + dy * dy <= r * r {
                    img.put_pixel(x, y, Luma([230]));
                }
            }
        }
    }
    img
}

fn bench_segmenter(c: &mut Criterion) {
    let background = make_frame(1, 0);
    let moving = make_frame(2, 12);
    let mut seg = MotionSegmenter::new(SegmenterConfig::default());
    for _ in 0..20 {
        seg.apply(&background);
    }

    c.bench_function("segmenter_apply_512x424", |b| {
        b.iter(|| {
            let mask = seg.apply(black_box(&moving));
            black_box(mask.as_raw()[0])
        })
    });
}

fn bench_blob_detect(c: &mut Criterion) {
    let mask = make_frame(3, 24);
    let detector = BlobDetector::new(BlobConfig::default());

    c.bench_function("blob_detect_512x424_24spots", |b| {
        b.iter(|| black_box(detector.detect(black_box(&mask)).len()))
    });
}

fn bench_engine_tick(c: &mut Criterion) {
    let mut source = SyntheticSource::new(SyntheticScene::default());
    let frames: Vec<_> = {
        let _ = source.start();
        (0..120)
            .filter_map(|_| source.next_frame(Duration::from_secs(1)).ok().flatten())
            .collect()
    };
    let mut engine = TraceEngine::new(CaptureConfig::default(), Box::new(NullSink))
        .expect("default config is valid");
    let mut next = 0usize;

    c.bench_function("engine_tick_512x424", |b| {
        b.iter(|| {
            let frame = &frames[next % frames.len()];
            next += 1;
            let report = engine.process(black_box(frame));
            black_box(report.map(|r| r.accepted).unwrap_or(0))
        })
    });
}

criterion_group!(hotpaths, bench_segmenter, bench_blob_detect, bench_engine_tick);
criterion_main!(hotpaths);
