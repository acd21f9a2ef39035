use anyhow::Result;
use serde_json::json;

use kjarni_cvae::Transformer;

use super::util::{load_params, make_rng, parse_id_batch};

pub fn run(
    ids: &str,
    preset: &str,
    config: Option<&str>,
    beam_size: Option<usize>,
    alpha: Option<f32>,
    seed: Option<u64>,
) -> Result<()> {
    let mut params = load_params(preset, config)?;
    if let Some(beam_size) = beam_size {
        params.beam_size = beam_size;
    }
    if let Some(alpha) = alpha {
        params.alpha = alpha;
    }

    let inputs = parse_id_batch(ids)?;
    let mut rng = make_rng(seed);

    log::info!("Building model for {} example(s)", inputs.nrows());
    let model = Transformer::new_random(params, &mut rng)?;
    let output = model.infer_with_rng(&inputs, &mut rng)?;

    let results: Vec<_> = output
        .outputs
        .iter()
        .zip(&output.scores)
        .map(|(tokens, score)| json!({ "ids": tokens, "score": score }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
