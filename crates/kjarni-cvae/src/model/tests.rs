use anyhow::Result;
use ndarray::{arr2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;

fn scenario_params() -> TransformerParams {
    TransformerParams {
        vocab_size: 10,
        hidden_size: 4,
        num_heads: 2,
        num_hidden_layers: 2,
        filter_size: 8,
        latent_size: 2,
        beam_size: 2,
        alpha: 1.0,
        extra_decode_length: 2,
        ..TransformerParams::tiny()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tiny_model(seed: u64) -> Transformer {
    let mut rng = StdRng::seed_from_u64(seed);
    Transformer::new_random(TransformerParams::tiny(), &mut rng).unwrap()
}

#[test]
fn test_invalid_params_are_rejected() {
    let params = TransformerParams {
        num_heads: 3,
        ..TransformerParams::tiny()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let err = Transformer::new_random(params, &mut rng).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ModelError>(),
        Some(ModelError::InvalidConfig(_))
    ));
}

#[test]
fn test_shift_right_inserts_zero_start() {
    let x = Array3::from_shape_fn((1, 3, 2), |(_, t, h)| (t * 2 + h + 1) as f32);
    let shifted = shift_right(&x);
    assert_eq!(
        shifted.into_raw_vec_and_offset().0,
        vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]
    );
}

#[test]
fn test_train_forward_shapes() -> Result<()> {
    let model = tiny_model(1);
    let params = model.params().clone();
    let inputs = arr2(&[[3u32, 5, 2, 0], [7, 8, 9, 4]]);
    let targets = arr2(&[[4u32, 6, 1], [5, 1, 0]]);

    let mut rng = StdRng::seed_from_u64(2);
    let out = model.train_forward_with_rng(&inputs, &targets, &mut rng)?;

    assert_eq!(out.logits.dim(), (2, 3, params.vocab_size));
    assert!(out.logits.iter().all(|v| v.is_finite()));
    for latent in [
        &out.latent_sample,
        &out.prior_mu,
        &out.prior_logvar,
        &out.recog_mu,
        &out.recog_logvar,
    ] {
        assert_eq!(latent.dim(), (2, params.latent_size));
    }
    Ok(())
}

#[test]
fn test_training_samples_differ_but_distributions_match() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let model = Transformer::new_random(TransformerParams::tiny().without_dropout(), &mut rng)?;
    let inputs = arr2(&[[3u32, 5, 2]]);
    let targets = arr2(&[[6u32, 7, 1]]);

    let a = model.train_forward_with_rng(&inputs, &targets, &mut rng)?;
    let b = model.train_forward_with_rng(&inputs, &targets, &mut rng)?;

    assert_ne!(a.latent_sample, b.latent_sample);
    assert_eq!(a.prior_mu, b.prior_mu);
    assert_eq!(a.prior_logvar, b.prior_logvar);
    assert_eq!(a.recog_mu, b.recog_mu);
    assert_eq!(a.recog_logvar, b.recog_logvar);
    Ok(())
}

#[test]
fn test_train_forward_rejects_batch_mismatch() {
    let model = tiny_model(4);
    let inputs = arr2(&[[3u32, 5, 2]]);
    let targets = arr2(&[[6u32, 1], [7, 1]]);
    assert!(model.train_forward(&inputs, &targets).is_err());
}

#[test]
fn test_out_of_vocab_id_is_an_error() {
    let model = tiny_model(5);
    let inputs = arr2(&[[3u32, 500]]);
    assert!(model.infer(&inputs).is_err());
}

#[test]
fn test_infer_scenario() -> Result<()> {
    init_logging();
    let mut rng = StdRng::seed_from_u64(6);
    let model = Transformer::new_random(scenario_params(), &mut rng)?;

    let out = model.infer_with_rng(&arr2(&[[3u32, 5, 2]]), &mut rng)?;

    assert_eq!(out.outputs.len(), 1);
    assert_eq!(out.scores.len(), 1);
    assert!(out.outputs[0].len() <= 5);
    assert!(out.scores[0].is_finite());
    assert!(out.scores[0] <= 0.0);
    Ok(())
}

#[test]
fn test_infer_batch_strips_eos() -> Result<()> {
    init_logging();
    let model = tiny_model(7);
    let eos = model.params().eos_id;
    let inputs = arr2(&[[3u32, 5, 2, 0], [9, 8, 7, 6]]);

    let out = model.infer_with_rng(&inputs, &mut StdRng::seed_from_u64(8))?;

    let max_len = inputs.ncols() + model.params().extra_decode_length;
    assert_eq!(out.outputs.len(), 2);
    for tokens in &out.outputs {
        assert!(tokens.len() <= max_len);
        assert!(!tokens.contains(&eos));
        assert!(tokens.iter().all(|&t| (t as usize) < model.params().vocab_size));
    }
    Ok(())
}

#[test]
fn test_num_parameters_counts_every_component() {
    let model = tiny_model(9);
    let params = model.params();
    let embeddings = params.vocab_size * params.hidden_size;
    assert!(model.num_parameters() > embeddings);
}
