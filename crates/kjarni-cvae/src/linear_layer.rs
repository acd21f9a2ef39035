//! Dense f32 projection with weights stored as `[in_features, out_features]`.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3, ArrayView2};
use rand::Rng;

use crate::error::ModelError;
use crate::init::variance_scaling_uniform;
use crate::utils::linear_algebra::matmul_3d_2d;

#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Result<Self> {
        let bias = bias.into();
        if let Some(b) = &bias {
            if b.len() != weight.ncols() {
                anyhow::bail!(ModelError::shape(
                    "LinearLayer bias",
                    &[weight.ncols()],
                    &[b.len()]
                ));
            }
        }
        Ok(Self { weight, bias })
    }

    /// Randomly initialised layer; the bias, when present, starts at zero.
    pub fn random<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        gain: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: variance_scaling_uniform(in_features, out_features, gain, rng),
            bias: with_bias.then(|| Array1::zeros(out_features)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    /// `[rows, in] -> [rows, out]`
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = input.dot(&self.weight);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }

    /// `[batch, seq, in] -> [batch, seq, out]`
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let mut out = matmul_3d_2d(input, &self.weight.view())?;
        if let Some(bias) = &self.bias {
            out += bias;
        }
        Ok(out)
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_matmul_basic() -> Result<()> {
        // [in=2, out=2]
        let layer = LinearLayer::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]), None)?;
        let input = arr2(&[[1.0, 1.0]]);
        // [1*1 + 1*3, 1*2 + 1*4]
        assert_eq!(layer.matmul(&input.view()), arr2(&[[4.0, 6.0]]));
        Ok(())
    }

    #[test]
    fn test_forward_with_bias() -> Result<()> {
        let layer = LinearLayer::new(arr2(&[[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]), arr1(&[10.0, 20.0, 30.0]))?;
        let input = Array3::from_shape_vec((1, 2, 2), vec![1.0, 2.0, 3.0, 4.0])?;
        let out = layer.forward(&input)?;
        assert_eq!(out.dim(), (1, 2, 3));
        assert_eq!(out[[0, 0, 0]], 11.0);
        assert_eq!(out[[0, 0, 2]], 33.0);
        assert_eq!(out[[0, 1, 1]], 24.0);
        Ok(())
    }

    #[test]
    fn test_bias_length_is_checked() {
        let result = LinearLayer::new(Array2::zeros((2, 3)), arr1(&[1.0, 2.0]));
        assert!(result.is_err());
    }

    #[test]
    fn test_random_layer_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = LinearLayer::random(6, 4, true, 1.0, &mut rng);
        assert_eq!((layer.in_features(), layer.out_features()), (6, 4));
        assert!(layer.bias.is_some());
        assert_eq!(layer.num_parameters(), 28);
        // limit = sqrt(3 / 5)
        let limit = (3.0f32 / 5.0).sqrt();
        assert!(layer.weight.iter().all(|w| w.abs() <= limit));
    }
}
