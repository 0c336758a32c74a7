use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use variant_renewal::generation::discretise_gamma;
use variant_renewal::mlr::simulate_mlr;
use variant_renewal::{
    InferNuts, InferenceConfig, ModelData, MultinomialLogisticRegression, RenewalSimulator,
};

fn renewal_inputs(len: usize) -> (Box<[f64]>, Vec<f64>, Vec<f64>) {
    let kernel = discretise_gamma(5.2, 1.7, 20).unwrap();
    let kernel_rev = kernel.iter().rev().copied().collect();
    let intros = (0..len).map(|t| if t < 7 { 100. } else { 0. }).collect();
    let r = (0..len).map(|t| 1. + 0.3 * (t as f64 / 30.).sin()).collect();
    (kernel_rev, intros, r)
}

fn mlr_data() -> ModelData {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let totals = vec![500.; 60];
    let (_, counts) =
        simulate_mlr(&mut rng, &[1.4, 1.1, 1.], &[0.05, 0.15, 0.8], 5.2, &totals).unwrap();
    ModelData::new(counts, vec!["a".into(), "b".into(), "c".into()]).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    for len in [100, 1000] {
        let (kernel_rev, intros, r) = renewal_inputs(len);
        let simulator = RenewalSimulator::new(&kernel_rev, None);
        c.bench_function(&format!("renewal simulate {len}"), |b| {
            b.iter(|| simulator.simulate(black_box(&intros), black_box(&r)).unwrap())
        });
    }

    let (kernel_rev, intros, r) = renewal_inputs(365);
    let delays = discretise_gamma(3., 1., 10).unwrap();
    let simulator = RenewalSimulator::new(&kernel_rev, Some(&delays[..]));
    c.bench_function("renewal simulate 365 with delays", |b| {
        b.iter(|| simulator.simulate(black_box(&intros), black_box(&r)).unwrap())
    });

    let data = mlr_data();
    let model = MultinomialLogisticRegression::new(5.2).unwrap();
    let config = InferenceConfig {
        num_warmup: 100,
        num_samples: 100,
        seed: 0,
    };
    c.bench_function("fit mlr 60x3", |b| {
        b.iter(|| {
            InferNuts::new(config)
                .fit(&model, black_box(data.clone()), None)
                .unwrap()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
