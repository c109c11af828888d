use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::errors::FalkonError;

/// Strategy for picking the Nystrom centers out of the training set.
///
/// Selection happens once per fit; the returned matrix is owned by the
/// fitted model and never modified afterwards.
pub trait CenterSelector {
    fn select(&mut self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError>;
}

/// Uniform sampling of `num_centers` distinct training rows, driven by a
/// locally-owned seeded generator so repeated fits with the same seed pick
/// the same centers.
pub struct UniformSelector {
    num_centers: usize,
    rng: StdRng,
}

impl UniformSelector {
    pub fn new(num_centers: usize, seed: Option<u64>) -> Result<Self, FalkonError> {
        if num_centers == 0 {
            return Err(FalkonError::Configuration(
                "the number of Nystrom centers must be at least 1".to_string(),
            ));
        }
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(UniformSelector { num_centers, rng })
    }
}

impl CenterSelector for UniformSelector {
    fn select(&mut self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, FalkonError> {
        let n = x.nrows();
        if self.num_centers > n {
            return Err(FalkonError::Configuration(format!(
                "cannot select {} centers from {} samples",
                self.num_centers, n
            )));
        }
        // Distinct indices, kept in selection order.
        let indices: Vec<usize> = rand::seq::index::sample(&mut self.rng, n, self.num_centers).into_vec();
        Ok(x.select_rows(indices.iter()))
    }
}
