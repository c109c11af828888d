use std::time::Instant;

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, StandardNormal};

use falkon::{Falkon, FalkonOptions, GaussianKernel, Kernel};

/// Demo: fit a noisy nonlinear regression problem with the Nystrom solver
/// and compare against the exact (dense) kernel ridge solution.
fn main() {
    env_logger::init();

    let (n, d, m) = (4000usize, 10usize, 800usize);
    let mut rng = StdRng::seed_from_u64(92);
    let noise = Normal::new(0.0, 0.05).unwrap();
    let x = DMatrix::<f64>::from_fn(n, d, |_, _| StandardNormal.sample(&mut rng));
    let y = DMatrix::from_fn(n, 1, |i, _| {
        let r = x.row(i);
        (1.5 * r[0]).sin() + 0.5 * (r[1] * r[2]).cos() + noise.sample(&mut rng)
    });

    let penalty = 1e-6;
    let kernel = GaussianKernel::new(3.0).expect("valid bandwidth");
    let opts = FalkonOptions {
        max_iterations: 30,
        cg_tolerance: 1e-9,
        ..FalkonOptions::default()
    };
    let mut model = Falkon::new(kernel.clone(), penalty, m, Some(92), opts)
        .expect("valid configuration")
        .with_error_fn(Box::new(|y, p| (mse(y, p), "mse".to_string())), 5)
        .expect("valid cadence");

    let start = Instant::now();
    model.fit(&x, &y, None, None).expect("fit failed");
    let nystrom_time = start.elapsed();

    for rec in model.fit_trace() {
        match (rec.error, rec.error_label.as_deref()) {
            (Some(err), Some(label)) => println!(
                "iteration {:3} - elapsed {:.2?} - {}: {:.3e}",
                rec.iteration, rec.elapsed, label, err
            ),
            _ => println!("iteration {:3} - elapsed {:.2?}", rec.iteration, rec.elapsed),
        }
    }

    let pred = model.predict(&x).expect("predict failed");
    println!(
        "nystrom solve ({} centers): {:.2?}, training mse {:.3e}, {:?}",
        m,
        nystrom_time,
        mse(&y, &pred),
        model.stop_reason().unwrap()
    );

    // Exact dense solve on a subsample, an order of magnitude smaller so it
    // finishes in comparable time.
    let ns = 1500.min(n);
    let xs = x.rows(0, ns).into_owned();
    let ys = y.rows(0, ns).into_owned();
    let start = Instant::now();
    let k = kernel.full(&xs, &xs, None).expect("kernel failed");
    let reg = &k + DMatrix::identity(ns, ns) * (penalty * ns as f64);
    let alpha = reg.lu().solve(&ys).expect("dense solve failed");
    let direct_time = start.elapsed();
    println!(
        "dense solve ({} samples): {:.2?}, training mse {:.3e}",
        ns,
        direct_time,
        mse(&ys, &(&k * &alpha))
    );
}

fn mse(y: &DMatrix<f64>, pred: &DMatrix<f64>) -> f64 {
    (y - pred).map(|v| v * v).sum() / y.nrows() as f64
}
