use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kjarni-cvae")]
#[command(about = "Conditional variational transformer: inspect configs, run training and inference passes", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Print hyperparameters as JSON
    Config {
        /// Parameter preset (tiny, base, big)
        #[arg(short, long, default_value = "tiny")]
        preset: String,

        /// Load from a .toml or .json file instead of a preset
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Beam-search decode source ids with a randomly initialised model
    Infer {
        /// Space separated ids; separate examples with ';'
        #[arg(short, long)]
        ids: String,

        /// Parameter preset (tiny, base, big)
        #[arg(short, long, default_value = "tiny")]
        preset: String,

        /// Load from a .toml or .json file instead of a preset
        #[arg(short, long)]
        config: Option<String>,

        /// Override the beam width
        #[arg(long)]
        beam_size: Option<usize>,

        /// Override the length penalty exponent
        #[arg(long)]
        alpha: Option<f32>,

        /// Seed for parameters and latent sampling
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run the teacher-forced training pass and summarise its outputs
    TrainForward {
        /// Space separated source ids; separate examples with ';'
        #[arg(short, long)]
        ids: String,

        /// Space separated target ids, one example per source example
        #[arg(short, long)]
        targets: String,

        /// Parameter preset (tiny, base, big)
        #[arg(short, long, default_value = "tiny")]
        preset: String,

        /// Load from a .toml or .json file instead of a preset
        #[arg(short, long)]
        config: Option<String>,

        /// Seed for parameters, dropout and latent sampling
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse_args(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut full_args = vec!["kjarni-cvae"];
        full_args.extend(args);
        Cli::try_parse_from(full_args)
    }

    #[test]
    fn test_config_defaults() {
        let cli = parse_args(&["config"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Config {
                preset: "tiny".to_string(),
                config: None,
            }
        );
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_infer_arguments() {
        let cli = parse_args(&["infer", "--ids", "3 5 2", "--seed", "7", "--beam-size", "2", "-vv"]).unwrap();

        match cli.command {
            Commands::Infer {
                ids,
                preset,
                beam_size,
                alpha,
                seed,
                ..
            } => {
                assert_eq!(ids, "3 5 2");
                assert_eq!(preset, "tiny");
                assert_eq!(beam_size, Some(2));
                assert!(alpha.is_none());
                assert_eq!(seed, Some(7));
            }
            _ => panic!("Expected Infer command"),
        }
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_infer_requires_ids() {
        assert!(parse_args(&["infer"]).is_err());
    }

    #[test]
    fn test_train_forward_arguments() {
        let cli = parse_args(&["train-forward", "-i", "3 5", "-t", "4 1", "-p", "base"]).unwrap();

        match cli.command {
            Commands::TrainForward {
                ids,
                targets,
                preset,
                config,
                seed,
            } => {
                assert_eq!(ids, "3 5");
                assert_eq!(targets, "4 1");
                assert_eq!(preset, "base");
                assert!(config.is_none());
                assert!(seed.is_none());
            }
            _ => panic!("Expected TrainForward command"),
        }
    }
}
