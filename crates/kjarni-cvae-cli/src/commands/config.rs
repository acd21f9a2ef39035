use anyhow::Result;

use super::util::load_params;

pub fn run(preset: &str, config: Option<&str>) -> Result<()> {
    let params = load_params(preset, config)?;
    println!("{}", params.to_json()?);
    Ok(())
}
