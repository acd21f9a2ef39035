use anyhow::Result;
use ndarray::{linalg::general_mat_mul, Array3, Array4, ArrayView2, Zip};

use crate::error::ModelError;

/// Matmul of a `[batch, seq, in]` tensor with an `[in, out]` weight matrix.
#[inline]
pub fn matmul_3d_2d(a: &Array3<f32>, b: &ArrayView2<f32>) -> Result<Array3<f32>> {
    let (batch, m, k) = a.dim();
    let (k2, n) = b.dim();
    if k != k2 {
        anyhow::bail!(ModelError::shape("matmul_3d_2d", &[k2], &[k]));
    }
    let a_std = a.as_standard_layout();
    let a_flat = a_std.view().into_shape_with_order((batch * m, k))?;
    let c_flat = a_flat.dot(b);
    Ok(c_flat.into_shape_with_order((batch, m, n))?)
}

/// Batched matmul over the two leading axes: `[b, h, m, k] x [b, h, k, n]`.
#[inline]
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, seq1, _) = a.dim();
    let seq2 = b.shape()[3];

    let mut output = Array4::<f32>::zeros((batch, heads, seq1, seq2));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    general_mat_mul(1.0, &a_h, &b_h, 0.0, &mut out_h);
                });
        });

    output
}
