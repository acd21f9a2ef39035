use anyhow::{anyhow, Result};
use ndarray::Array2;
use serde_json::{json, Value};

use kjarni_cvae::Transformer;

use super::util::{load_params, make_rng, parse_id_batch};

fn summary(x: &Array2<f32>) -> Value {
    let mean = x.mean().unwrap_or(0.0);
    let var = x.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
    json!({ "shape": x.shape(), "mean": mean, "std": var.sqrt() })
}

pub fn run(
    ids: &str,
    targets: &str,
    preset: &str,
    config: Option<&str>,
    seed: Option<u64>,
) -> Result<()> {
    let params = load_params(preset, config)?;
    let inputs = parse_id_batch(ids)?;
    let targets = parse_id_batch(targets)?;
    if inputs.nrows() != targets.nrows() {
        return Err(anyhow!(
            "{} source example(s) but {} target example(s)",
            inputs.nrows(),
            targets.nrows()
        ));
    }

    let mut rng = make_rng(seed);
    let model = Transformer::new_random(params, &mut rng)?;
    let out = model.train_forward_with_rng(&inputs, &targets, &mut rng)?;

    let report = json!({
        "logits_shape": out.logits.shape(),
        "latent_sample": summary(&out.latent_sample),
        "prior_mu": summary(&out.prior_mu),
        "prior_logvar": summary(&out.prior_logvar),
        "recog_mu": summary(&out.recog_mu),
        "recog_logvar": summary(&out.recog_logvar),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
