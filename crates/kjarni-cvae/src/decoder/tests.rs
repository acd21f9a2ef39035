use anyhow::Result;
use approx::assert_abs_diff_eq;
use ndarray::{arr2, s, Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::utils::masks::{attention_bias, causal_bias};

struct Fixture {
    params: TransformerParams,
    decoder: DecoderStack,
    encoder_outputs: Array3<f32>,
    cross_bias: Array4<f32>,
    latent: Array2<f32>,
}

fn fixture(seed: u64) -> Fixture {
    let params = TransformerParams::tiny().without_dropout();
    let mut rng = StdRng::seed_from_u64(seed);
    let decoder = DecoderStack::random(&params, &mut rng).unwrap();

    let src = arr2(&[[3u32, 5, 2], [7, 0, 0]]);
    let encoder_outputs = Array3::from_shape_fn((2, 3, params.hidden_size), |(b, t, h)| {
        ((b * 13 + t * 5 + h) as f32 * 0.17).sin()
    });
    let latent = Array2::from_shape_fn((2, params.latent_size), |(b, l)| (b as f32 - l as f32) * 0.1);

    Fixture {
        params,
        decoder,
        encoder_outputs,
        cross_bias: attention_bias(&src),
        latent,
    }
}

fn decoder_inputs(len: usize, hidden: usize) -> Array3<f32> {
    Array3::from_shape_fn((2, len, hidden), |(b, t, h)| ((b + 2 * t + 3 * h) as f32 * 0.07).cos())
}

#[test]
fn test_concat_latent_tiles_every_position() -> Result<()> {
    let hidden = Array3::<f32>::zeros((2, 3, 4));
    let latent = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
    let out = concat_latent(&hidden, &latent)?;

    assert_eq!(out.dim(), (2, 3, 6));
    for t in 0..3 {
        assert_eq!(out.slice(s![0, t, 4..]).to_vec(), vec![1.0, 2.0]);
        assert_eq!(out.slice(s![1, t, 4..]).to_vec(), vec![3.0, 4.0]);
        assert!(out.slice(s![.., t, ..4]).iter().all(|v| *v == 0.0));
    }
    Ok(())
}

#[test]
fn test_concat_latent_rejects_wrong_batch() {
    let hidden = Array3::<f32>::zeros((2, 3, 4));
    let latent = Array2::<f32>::zeros((3, 2));
    assert!(concat_latent(&hidden, &latent).is_err());
}

#[test]
fn test_full_pass_shape() -> Result<()> {
    let f = fixture(31);
    let inputs = decoder_inputs(4, f.params.hidden_size);
    let out = f.decoder.forward(
        &inputs,
        &f.encoder_outputs,
        &causal_bias(4),
        &f.cross_bias,
        &f.latent,
        None,
        &mut Dropout::disabled(),
    )?;
    assert_eq!(out.dim(), (2, 4, f.params.hidden_size));
    assert!(out.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn test_cached_steps_match_full_causal_pass() -> Result<()> {
    let f = fixture(32);
    let len = 5;
    let hidden = f.params.hidden_size;
    let inputs = decoder_inputs(len, hidden);
    let full_bias = causal_bias(len);

    let full = f.decoder.forward(
        &inputs,
        &f.encoder_outputs,
        &full_bias,
        &f.cross_bias,
        &f.latent,
        None,
        &mut Dropout::disabled(),
    )?;

    let mut caches: Vec<LayerKvCache> = (0..f.decoder.num_layers())
        .map(|layer| LayerKvCache::new(layer, 2, len, hidden))
        .collect();

    for i in 0..len {
        let step_input = inputs.slice(s![.., i..i + 1, ..]).to_owned();
        let step_bias = full_bias.slice(s![.., .., i..i + 1, ..i + 1]).to_owned();
        let step = f.decoder.forward(
            &step_input,
            &f.encoder_outputs,
            &step_bias,
            &f.cross_bias,
            &f.latent,
            Some(caches.as_mut_slice()),
            &mut Dropout::disabled(),
        )?;

        assert_eq!(step.dim(), (2, 1, hidden));
        for (a, b) in step.slice(s![.., 0, ..]).iter().zip(full.slice(s![.., i, ..]).iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }
    assert!(caches.iter().all(|c| c.len() == len));
    Ok(())
}

#[test]
fn test_latent_changes_output() -> Result<()> {
    let f = fixture(33);
    let inputs = decoder_inputs(3, f.params.hidden_size);
    let bias = causal_bias(3);

    let a = f.decoder.forward(
        &inputs,
        &f.encoder_outputs,
        &bias,
        &f.cross_bias,
        &f.latent,
        None,
        &mut Dropout::disabled(),
    )?;
    let shifted = f.latent.mapv(|v| v + 1.0);
    let b = f.decoder.forward(
        &inputs,
        &f.encoder_outputs,
        &bias,
        &f.cross_bias,
        &shifted,
        None,
        &mut Dropout::disabled(),
    )?;
    assert_ne!(a, b);
    Ok(())
}

#[test]
fn test_wrong_cache_count_is_rejected() {
    let f = fixture(34);
    let inputs = decoder_inputs(1, f.params.hidden_size);
    let mut caches = vec![LayerKvCache::new(0, 2, 4, f.params.hidden_size)];
    let result = f.decoder.forward(
        &inputs,
        &f.encoder_outputs,
        &causal_bias(1),
        &f.cross_bias,
        &f.latent,
        Some(caches.as_mut_slice()),
        &mut Dropout::disabled(),
    );
    assert!(result.is_err());
}
