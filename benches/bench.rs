use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array3;
use num_complex::Complex;
use uvclip::{
    clip_complex, flag_bandpass, flag_birdies, BSplineModel, ClipParamsBuilder, FlagParams,
    MaskPolicy,
};

const NUM_CHANNELS: usize = 3072;
const NUM_TIMESTEPS: usize = 16;
const NUM_BASELINES: usize = 128;

/// A sloped cubic bandpass with deterministic jitter and a handful of
/// narrowband spikes.
fn synthetic_spectrum(num_channels: usize) -> (Vec<f64>, Vec<f64>) {
    let mut re = Vec::with_capacity(num_channels);
    let mut im = Vec::with_capacity(num_channels);
    for c in 0..num_channels {
        let x = c as f64 / (num_channels - 1) as f64;
        let amp = 8.0 + 2.0 * x - 1.5 * x * x + x * x * x;
        let noise = 0.001 * (((3 * c) % 7) as f64 - 3.0);
        let spike = if c % 611 == 13 { 40.0 } else { 0.0 };
        re.push(amp + noise + spike);
        im.push(0.3 * amp + noise);
    }
    (re, im)
}

fn synthetic_cube(
    num_timesteps: usize,
    num_channels: usize,
    num_baselines: usize,
) -> Array3<Complex<f32>> {
    let (re, im) = synthetic_spectrum(num_channels);
    Array3::from_shape_fn((num_timesteps, num_channels, num_baselines), |(t, c, b)| {
        let jitter = 0.001 * (((t + 5 * b) % 3) as f32);
        Complex::new(re[c] as f32 + jitter, im[c] as f32 + jitter)
    })
}

fn bench_clip_bandpass_spectrum(crt: &mut Criterion) {
    let (re, im) = synthetic_spectrum(NUM_CHANNELS);
    let params = ClipParamsBuilder::default()
        .nsigma(5.0)
        .policy(MaskPolicy::FullRecompute)
        .build()
        .unwrap();

    crt.bench_function(
        format!("clip_complex - bspline, {} channels", NUM_CHANNELS).as_str(),
        |bch| {
            bch.iter(|| {
                let mut model_re = BSplineModel::new();
                let mut model_im = BSplineModel::new();
                clip_complex(
                    black_box(&re),
                    black_box(&im),
                    None,
                    &mut model_re,
                    &mut model_im,
                    black_box(&params),
                )
                .unwrap();
            });
        },
    );
}

fn bench_flag_birdies_cube(crt: &mut Criterion) {
    let vis = synthetic_cube(NUM_TIMESTEPS, NUM_CHANNELS, NUM_BASELINES);
    let mut params = FlagParams::birdie();
    params.draw_progress = false;

    crt.bench_function(
        format!(
            "flag_birdies - {}x{}x{}",
            NUM_TIMESTEPS, NUM_CHANNELS, NUM_BASELINES
        )
        .as_str(),
        |bch| {
            bch.iter(|| {
                let mut flags = Array3::from_elem(vis.dim(), false);
                flag_birdies(black_box(vis.view()), flags.view_mut(), &params).unwrap();
            });
        },
    );
}

fn bench_flag_bandpass_cube(crt: &mut Criterion) {
    let vis = synthetic_cube(NUM_TIMESTEPS, NUM_CHANNELS, NUM_BASELINES);
    let mut params = FlagParams::bandpass();
    params.draw_progress = false;

    crt.bench_function(
        format!(
            "flag_bandpass - {}x{}x{}",
            NUM_TIMESTEPS, NUM_CHANNELS, NUM_BASELINES
        )
        .as_str(),
        |bch| {
            bch.iter(|| {
                let mut flags = Array3::from_elem(vis.dim(), false);
                flag_bandpass(black_box(vis.view()), flags.view_mut(), &params).unwrap();
            });
        },
    );
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets =
        bench_clip_bandpass_spectrum,
        bench_flag_birdies_cube,
        bench_flag_bandpass_cube,
);
criterion_main!(benches);
