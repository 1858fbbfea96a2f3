//! CLI entry point for flipflop-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flipflop_rs::{FlipflopConfig, Result, Trainer};

#[derive(Parser)]
#[command(name = "flipflop")]
#[command(about = "Train flip-flop basecalling models from mapped reads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from a .params checkpoint file
        #[arg(long)]
        resume: Option<String>,
        /// Allow writing into an existing output directory
        #[arg(long)]
        overwrite: bool,
        /// Override the configured device (auto, cpu, cuda:<index>)
        #[arg(long)]
        device: Option<String>,
        /// Override the configured random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("validating configuration: {}", config);
            let config = FlipflopConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Alphabet: {}", config.data.alphabet);
            println!("  Inputs: {}", config.data.inputs.join(", "));
            println!("  Iterations: {}", config.training.iterations);
        }
        Commands::Train {
            config,
            resume,
            overwrite,
            device,
            seed,
        } => {
            let mut config = FlipflopConfig::from_file(&config)?;
            if let Some(device) = device {
                config.training.device = device;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            config.validate()?;

            let output = std::path::Path::new(&config.output_dir);
            if output.exists() && !overwrite {
                eprintln!(
                    "Error: output directory {} exists, pass --overwrite to reuse it",
                    config.output_dir
                );
                std::process::exit(1);
            }
            if output.exists() && !output.is_dir() {
                eprintln!("Error: output location {} is not a directory", config.output_dir);
                std::process::exit(1);
            }

            let mut trainer = Trainer::new(config)?;
            if let Some(checkpoint) = resume {
                trainer.resume_from(&checkpoint)?;
            }
            trainer.train()?;
        }
        Commands::Init { output } => {
            let config = FlipflopConfig::dna_preset();
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
