use forcegp::hyperparameters::{SCALE, WEIGHT};
use forcegp::kernels::SquaredExponentialGradKernel;
use forcegp::priors::ConstantPrior;
use forcegp::{GaussianProcess, HyperOptAlgorithm, HyperOptParams, WeightCalibration};
use ndarray::{array, Array1, Array2};

/// Energy and forces of a 2D double well: `E = (x^2 - 1)^2 + y^2`
fn double_well(x: &Array1<f64>) -> (f64, Array1<f64>) {
    let energy = (x[0] * x[0] - 1.).powi(2) + x[1] * x[1];
    let forces = array![-4. * x[0] * (x[0] * x[0] - 1.), -2. * x[1]];
    (energy, forces)
}

fn main() {
    env_logger::init();

    let xt: Vec<Array1<f64>> = vec![
        array![-1.2, 0.3],
        array![-0.6, -0.2],
        array![0., 0.4],
        array![0.5, 0.1],
        array![1.1, -0.3],
        array![0.9, 0.5],
    ];
    // targets are energies and gradients, i.e. opposite of the forces
    let mut yt = Array2::zeros((xt.len(), 3));
    for (x, mut y) in xt.iter().zip(yt.rows_mut()) {
        let (energy, forces) = double_well(x);
        y[0] = energy;
        y[1] = -forces[0];
        y[2] = -forces[1];
    }

    let mut gp = GaussianProcess::<f64, ConstantPrior<f64>, SquaredExponentialGradKernel>::params(
        ConstantPrior::default().with_update(true),
        SquaredExponentialGradKernel(),
    )
    .noise(1e-3)
    .build()
    .expect("GP build");
    gp.train(&xt, &yt, None).expect("GP training");
    println!("Initial model: {gp}");

    let params = HyperOptParams::new()
        .bounds(Some(vec![(0.1, 5.), (0.05, 5.)]))
        .algorithm(HyperOptAlgorithm::Slsqp);
    let res = gp
        .fit_hyperparameters_with(&xt, &yt, &[WEIGHT, SCALE], &params)
        .expect("Hyperparameters fitting");
    println!(
        "Fitted hyperparameters {} (converged={}, -logP={})",
        res.hyperparameters, res.converged, res.neg_log_likelihood
    );

    let weight = gp
        .fit_weight_only(&xt, &yt, WeightCalibration::Update)
        .expect("Weight calibration");
    println!("Calibrated weight: {weight}");
    println!("Final model: {gp}");

    for x in [array![-1., 0.], array![0.2, 0.2], array![1., 0.]] {
        let (f, cov) = gp.predict(&x, true).expect("GP prediction");
        let (energy, forces) = double_well(&x);
        let cov = cov.expect("GP covariance");
        println!(
            "x={x}: E={:.4} (true {energy:.4}, std {:.2e}), F=[{:.4}, {:.4}] (true {forces:.4})",
            f[0],
            cov[[0, 0]].max(0.).sqrt(),
            -f[1],
            -f[2],
        );
    }
}
