use anyhow::{anyhow, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

use kjarni_cvae::{TransformerParams, PAD_ID};

/// Parameters from a config file if given, otherwise from a named preset.
pub fn load_params(preset: &str, config: Option<&str>) -> Result<TransformerParams> {
    let params = match config {
        Some(path) => TransformerParams::from_file(path)
            .map_err(|e| anyhow!("Failed to load config '{}': {}", path, e))?,
        None => match preset.to_lowercase().as_str() {
            "tiny" => TransformerParams::tiny(),
            "base" => TransformerParams::base(),
            "big" => TransformerParams::big(),
            other => {
                return Err(anyhow!(
                    "Unknown preset: '{}'. Available presets: tiny, base, big",
                    other
                ))
            }
        },
    };
    params.validate()?;
    Ok(params)
}

/// Seeded RNG, or one seeded from entropy.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Parses `"3 5 2; 4 6"` into a padded `[batch, max_len]` id matrix.
pub fn parse_id_batch(text: &str) -> Result<Array2<u32>> {
    let rows: Vec<Vec<u32>> = text
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|row| {
            row.split_whitespace()
                .map(|tok| {
                    tok.parse::<u32>()
                        .map_err(|e| anyhow!("Invalid token id '{}': {}", tok, e))
                })
                .collect::<Result<Vec<u32>>>()
        })
        .collect::<Result<_>>()?;

    if rows.is_empty() {
        return Err(anyhow!("No token ids provided"));
    }

    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Array2::from_elem((rows.len(), max_len), PAD_ID);
    for (b, row) in rows.iter().enumerate() {
        for (t, &id) in row.iter().enumerate() {
            ids[[b, t]] = id;
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_parse_single_example() {
        assert_eq!(parse_id_batch("3 5 2").unwrap(), arr2(&[[3, 5, 2]]));
    }

    #[test]
    fn test_parse_pads_short_examples() {
        assert_eq!(
            parse_id_batch("3 5 2; 7 ;").unwrap(),
            arr2(&[[3, 5, 2], [7, 0, 0]])
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_id_batch("3 x").is_err());
        assert!(parse_id_batch(" ; ").is_err());
    }

    #[test]
    fn test_unknown_preset() {
        assert!(load_params("huge", None).is_err());
        assert_eq!(load_params("TINY", None).unwrap(), TransformerParams::tiny());
    }
}
