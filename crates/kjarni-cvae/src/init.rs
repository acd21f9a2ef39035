//! Parameter initialisation.

use ndarray::{Array1, Array2};
use rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;

/// Variance scaling, fan-average mode, uniform distribution.
///
/// Samples from `U(-limit, limit)` with `limit = sqrt(3 * gain / fan_avg)`.
pub fn variance_scaling_uniform<R: Rng + ?Sized>(
    fan_in: usize,
    fan_out: usize,
    gain: f32,
    rng: &mut R,
) -> Array2<f32> {
    let fan_avg = ((fan_in + fan_out) as f32 / 2.0).max(1.0);
    let limit = (3.0 * gain / fan_avg).sqrt();
    Array2::random_using((fan_in, fan_out), Uniform::new_inclusive(-limit, limit), rng)
}

/// Embedding table drawn from `N(0, hidden_size^-0.5)`.
pub fn embedding_table<R: Rng + ?Sized>(vocab_size: usize, hidden_size: usize, rng: &mut R) -> Array2<f32> {
    let std = (hidden_size as f32).powf(-0.5);
    match Normal::new(0.0, std) {
        Ok(dist) => Array2::random_using((vocab_size, hidden_size), dist, rng),
        Err(_) => Array2::zeros((vocab_size, hidden_size)),
    }
}

/// Layer-norm scale and bias: ones and zeros.
pub fn layer_norm_params(width: usize) -> (Array1<f32>, Array1<f32>) {
    (Array1::ones(width), Array1::zeros(width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_variance_scaling_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = variance_scaling_uniform(100, 300, 2.0, &mut rng);
        let limit = (3.0f32 * 2.0 / 200.0).sqrt();
        assert_eq!(w.dim(), (100, 300));
        assert!(w.iter().all(|x| x.abs() <= limit));
        assert!(w.iter().any(|x| x.abs() > limit / 2.0));
    }

    #[test]
    fn test_embedding_table_std() {
        let mut rng = StdRng::seed_from_u64(2);
        let table = embedding_table(200, 64, &mut rng);
        let var = table.mapv(|x| x * x).mean().unwrap_or(0.0);
        assert!((var - 1.0 / 64.0).abs() < 0.003, "var = {}", var);
    }
}
