// ========================================================================================
//
//                      SILL REML FIT BENCHMARK
//
// ========================================================================================
//
// Measures the cost of a full profiled-REML fit of an exponential covariance with a
// nugget as the number of observed locations grows. Every likelihood evaluation is a
// dense Cholesky factorisation, so the fit should scale roughly cubically.
//
// ========================================================================================

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use sill::faer_ndarray::FaerCholesky;
use sill::{
    distance_matrix, fit_geostatistical, Coordinate, EstimationSettings, GeostatFamily,
    GeostatSpec, KernelParams, TrainingData,
};

/// The location counts to benchmark.
const SIZES: [usize; 4] = [50, 100, 200, 400];

fn simulate(n: usize) -> (TrainingData, Vec<Coordinate>) {
    let mut rng = StdRng::seed_from_u64(n as u64);
    let coords: Vec<Coordinate> = (0..n)
        .map(|_| Coordinate::new(rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0)))
        .collect();
    let mut sigma = GeostatFamily::Exponential
        .evaluate_matrix(&distance_matrix(&coords), &KernelParams::new(1.0, 2.0));
    sigma.diag_mut().mapv_inplace(|v| v + 0.25);
    let lower = sigma
        .checked_cholesky()
        .expect("simulated covariance is positive definite")
        .lower();
    let z = Array1::from_shape_fn(n, |_| rng.sample::<f64, _>(StandardNormal));
    let x = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
    let y = x.mapv(|v| 2.0 + v) + lower.dot(&z);

    let response: Vec<Option<f64>> = y.iter().map(|&v| Some(v)).collect();
    let predictors = x.insert_axis(ndarray::Axis(1));
    let data = TrainingData::new(predictors.view(), &response, &["x"])
        .expect("simulated data is valid");
    (data, coords)
}

fn bench_reml_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("exponential_reml_fit");
    group.sample_size(10);
    let spec = GeostatSpec::new(GeostatFamily::Exponential);
    let settings = EstimationSettings::default();

    for &n in &SIZES {
        let (data, coords) = simulate(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let model = fit_geostatistical(
                    black_box(&data),
                    black_box(&coords),
                    &spec,
                    &settings,
                )
                .expect("fit succeeds");
                black_box(model.log_likelihood())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reml_fit);
criterion_main!(benches);
