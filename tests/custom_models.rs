use approx::assert_abs_diff_eq;
use faer::Mat;
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use variant_renewal::mlr::{forecast_frequencies, simulate_mlr};
use variant_renewal::options::{MultinomialSeq, PoissonCases};
use variant_renewal::{
    InferNuts, InferenceConfig, ModelData, MultinomialLogisticRegression, SplineIncidenceModel,
};

#[test]
fn mlr_recovers_growth_advantage() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let tau = 4.8;
    let totals = vec![200.; 30];
    let (_, counts) = simulate_mlr(&mut rng, &[1.5, 1.], &[0.1, 0.9], tau, &totals).unwrap();
    let data = ModelData::new(counts, vec!["new".into(), "old".into()]).unwrap();

    let model = MultinomialLogisticRegression::new(tau).unwrap();
    let config = InferenceConfig {
        num_warmup: 200,
        num_samples: 200,
        seed: 4,
    };
    let mut posterior = InferNuts::new(config).fit(&model, data, None).unwrap();

    let ga = posterior.samples.mean("ga").unwrap();
    assert_eq!(ga.len(), 1);
    assert!((ga[0] - 1.5).abs() < 0.15, "growth advantage {}", ga[0]);

    let freq = posterior.samples.get("freq").unwrap();
    assert_eq!(freq.shape(), &[30, 2]);
    let first = freq.draw(0).unwrap();
    assert_abs_diff_eq!(first[0] + first[1], 1., epsilon = 1e-9);

    forecast_frequencies(&mut posterior.samples, 5).unwrap();
    let forecast = posterior.samples.mean("freq_forecast").unwrap();
    assert_eq!(forecast.len(), 10);
    // The advantaged variant keeps growing.
    assert!(forecast[8] > forecast[0]);
}

#[test]
fn mlr_needs_two_variants() {
    let data = ModelData::new(Mat::from_fn(4, 1, |_, _| 3.), vec!["only".into()]).unwrap();
    let model = MultinomialLogisticRegression::new(5.).unwrap();
    let config = InferenceConfig {
        num_warmup: 1,
        num_samples: 1,
        seed: 0,
    };
    assert!(InferNuts::new(config).fit(&model, data, None).is_err());
}

#[test]
fn spline_model_produces_forecasts() {
    let num_t = 12;
    let cases: Vec<f64> = (0..num_t).map(|t| (20. * (0.1 * t as f64).exp()).round()).collect();
    let counts = Mat::from_fn(num_t, 2, |t, v| if v == 0 { t as f64 } else { 10. });
    let data = ModelData::new(counts, vec!["a".into(), "b".into()])
        .unwrap()
        .with_cases(cases)
        .unwrap();

    let model = SplineIncidenceModel::new(5, 3)
        .with_case_likelihood(PoissonCases)
        .with_seq_likelihood(MultinomialSeq);
    let config = InferenceConfig {
        num_warmup: 20,
        num_samples: 10,
        seed: 2,
    };
    let posterior = InferNuts::new(config).fit(&model, data, None).unwrap();

    let samples = &posterior.samples;
    assert_eq!(samples.num_draws(), 10);
    assert_eq!(samples.get("r").unwrap().shape(), &[num_t, 2]);
    assert_eq!(samples.get("freq_forecast").unwrap().shape(), &[3, 2]);
    assert_eq!(samples.get("cases").unwrap().shape(), &[num_t]);

    let freq = samples.get("freq").unwrap();
    for draw in 0..freq.num_draws() {
        let values = freq.draw(draw).unwrap();
        for row in values.chunks(2) {
            assert_abs_diff_eq!(row[0] + row[1], 1., epsilon = 1e-6);
        }
    }

    let batch = samples.to_record_batch().unwrap();
    assert_eq!(batch.num_rows(), 10);
    assert_eq!(batch.num_columns(), samples.len());
}
