mod commands;

use anyhow::Result;
use clap::Parser;

use kjarni_cvae_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Config { preset, config } => commands::config::run(&preset, config.as_deref()),

        Commands::Infer {
            ids,
            preset,
            config,
            beam_size,
            alpha,
            seed,
        } => commands::infer::run(&ids, &preset, config.as_deref(), beam_size, alpha, seed),

        Commands::TrainForward {
            ids,
            targets,
            preset,
            config,
            seed,
        } => commands::train_forward::run(&ids, &targets, &preset, config.as_deref(), seed),
    }
}
