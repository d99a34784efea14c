//! Benchmarks for the pure parts of thumbnail extraction: decoder output
//! parsing, timestamp planning and derivative rendering.
//!
//! Run with: cargo bench

use std::hint::black_box;

use criterion::Criterion;
use image::{DynamicImage, RgbImage};
use stillframe::{
    DerivativeSize, ResizeMode, derivative_path, fallback_ladder, frame_timestamps,
    parse_duration,
};

const BANNER: &str = "ffmpeg version 6.1 Copyright (c) 2000-2023 the FFmpeg developers
  built with gcc 13 (GCC)
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'input.mp4':
  Metadata:
    major_brand     : isom
    minor_version   : 512
    compatible_brands: isomiso2avc1mp41
    encoder         : Lavf60.16.100
  Duration: 00:12:34.56, start: 0.000000, bitrate: 2458 kb/s
  Stream #0:0[0x1](und): Video: h264 (High) (avc1 / 0x31637661), yuv420p, 1920x1080, 2321 kb/s, 30 fps
At least one output file must be specified";

fn benchmark_duration_parsing(criterion: &mut Criterion) {
    criterion.bench_function("parse duration from decoder banner", |bencher| {
        bencher.iter(|| parse_duration(black_box(BANNER)));
    });

    criterion.bench_function("parse duration (not available)", |bencher| {
        bencher.iter(|| parse_duration(black_box("  Duration: N/A, bitrate: N/A")));
    });
}

fn benchmark_timestamp_planning(criterion: &mut Criterion) {
    criterion.bench_function("plan 20 frame timestamps", |bencher| {
        bencher.iter(|| frame_timestamps(black_box(754.56), black_box(20)));
    });

    criterion.bench_function("build fallback ladder", |bencher| {
        bencher.iter(|| fallback_ladder(black_box(900.0), black_box(754.56)));
    });

    criterion.bench_function("derivative path", |bencher| {
        bencher.iter(|| derivative_path(black_box("public://videos/clip 42.mp4"), "square"));
    });
}

fn benchmark_rendering(criterion: &mut Criterion) {
    let frame = DynamicImage::ImageRgb8(RgbImage::new(1280, 720));
    let mut group = criterion.benchmark_group("render derivative");
    group.sample_size(20);

    for size in [
        DerivativeSize::new("large", 480, 480, ResizeMode::Fit),
        DerivativeSize::new("square", 100, 100, ResizeMode::Crop),
    ] {
        group.bench_function(size.name.clone(), |bencher| {
            bencher.iter(|| size.render(black_box(&frame)));
        });
    }

    group.finish();
}

criterion::criterion_group!(
    benches,
    benchmark_duration_parsing,
    benchmark_timestamp_planning,
    benchmark_rendering,
);
criterion::criterion_main!(benches);
