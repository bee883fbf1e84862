use bagsig_gp::experiment::{
    experiment_ard, experiment_precomputed, naive_experiment_prefix, run_trials, ExperimentConfig,
    IndexSplit,
};
use bagsig_gp::kernels::{flatten_bags, linear_gram};
use bagsig_gp::{KernelMode, Result, TrainerParams};
use ndarray::{Array, Array2, Array3, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

/// Bags of 3d random walks, the target being driven by the walks endpoints
fn bags(n_bags: usize) -> (Vec<Array2<f64>>, ndarray::Array1<f64>) {
    let mut rng = Xoshiro256Plus::seed_from_u64(0);
    let steps = Array3::random_using((n_bags, 10, 3), Normal::new(0., 0.2).unwrap(), &mut rng);
    let bags: Vec<Array2<f64>> = steps
        .outer_iter()
        .map(|s| {
            let mut path = s.to_owned();
            path.accumulate_axis_inplace(Axis(0), |&prev, cur| *cur += prev);
            path
        })
        .collect();
    let y = Array::from_iter(bags.iter().map(|b| {
        let end = b.row(9);
        10. + 2. * end[0] - end[1] + (3. * end[2]).sin()
    }));
    (bags, y)
}

fn main() -> Result<()> {
    env_logger::init();

    let (bags, y) = bags(100);
    let x = flatten_bags(&bags)?;
    let kernel = linear_gram(&x);

    let config = ExperimentConfig::precomputed(false)?.trainer(TrainerParams::new(2000));
    let summary = run_trials(5, |seed| {
        let split = IndexSplit::random(bags.len(), 0.2, seed)?;
        experiment_precomputed(&kernel, &y, &split, &config)
    })?;
    println!(
        "precomputed linear: test {} (std {})",
        summary.test_mean, summary.test_std
    );

    let config = ExperimentConfig::precomputed(true)?.trainer(TrainerParams::new(2000));
    let split = IndexSplit::random(bags.len(), 0.2, 0)?;
    let scores = experiment_precomputed(&kernel, &y, &split, &config)?;
    println!("rbf precomputed: train {} / test {}", scores.train, scores.test);

    let config = ExperimentConfig::ard(KernelMode::ArdFull, true)?.trainer(TrainerParams::new(500));
    let scores = experiment_ard(&x, &y, &split, &config)?;
    println!("full ARD: train {} / test {}", scores.train, scores.test);
    if let Some(lengthscales) = scores.lengthscales {
        println!("lengthscales: {lengthscales}");
    }

    let config = ExperimentConfig::naive(KernelMode::Ard { path_dims: 3 }, false)?;
    let scores = naive_experiment_prefix(&bags, &y, 80, &config)?;
    println!("naive ARD (first 80 bags): train {} / test {}", scores.train, scores.test);

    Ok(())
}
