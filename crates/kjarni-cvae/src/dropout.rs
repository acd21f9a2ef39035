//! Inverted dropout, active only on the training path.

use ndarray::{Array, Dimension};
use rand::rngs::StdRng;
use rand::Rng;

/// Dropout source threaded through a forward pass.
///
/// `Dropout::disabled()` is an identity and is what the inference path uses.
/// A training instance owns its RNG, so masks are drawn fresh on every call.
pub struct Dropout {
    rng: Option<StdRng>,
}

impl Dropout {
    pub fn disabled() -> Self {
        Self { rng: None }
    }

    pub fn training(rng: StdRng) -> Self {
        Self { rng: Some(rng) }
    }

    pub fn is_active(&self) -> bool {
        self.rng.is_some()
    }

    /// Zeroes each element with probability `rate` and rescales the rest by
    /// `1 / (1 - rate)`.
    pub fn apply<D: Dimension>(&mut self, mut x: Array<f32, D>, rate: f32) -> Array<f32, D> {
        let rng = match self.rng.as_mut() {
            Some(rng) if rate > 0.0 => rng,
            _ => return x,
        };
        let keep = 1.0 - rate;
        let scale = 1.0 / keep;
        x.mapv_inplace(|v| if rng.gen::<f32>() < keep { v * scale } else { 0.0 });
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;

    #[test]
    fn test_disabled_is_identity() {
        let x = Array2::from_elem((3, 4), 2.0f32);
        let mut dropout = Dropout::disabled();
        assert!(!dropout.is_active());
        assert_eq!(dropout.apply(x.clone(), 0.5), x);
    }

    #[test]
    fn test_zero_rate_is_identity() {
        let x = Array2::from_elem((3, 4), 2.0f32);
        let mut dropout = Dropout::training(StdRng::seed_from_u64(7));
        assert_eq!(dropout.apply(x.clone(), 0.0), x);
    }

    #[test]
    fn test_training_drops_and_rescales() {
        let x = Array2::from_elem((64, 64), 1.0f32);
        let mut dropout = Dropout::training(StdRng::seed_from_u64(7));
        let y = dropout.apply(x, 0.5);

        let zeros = y.iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 1500 && zeros < 2600, "zeros = {}", zeros);
        assert!(y.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_masks_differ_between_calls() {
        let x = Array2::from_elem((16, 16), 1.0f32);
        let mut dropout = Dropout::training(StdRng::seed_from_u64(3));
        let a = dropout.apply(x.clone(), 0.3);
        let b = dropout.apply(x, 0.3);
        assert_ne!(a, b);
    }
}
