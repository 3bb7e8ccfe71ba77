use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::Parser;
use training::{config::LaunchConfig, launch, overwatch::BANNER, ConfigOverride};

#[derive(Parser, Debug)]
#[command(author, version, about = "GPT-2 pretraining launcher", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Launch configuration (yaml, json or toml)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(long, help = "Resume from the latest checkpoint of the run")]
    resume: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("{BANNER}");

    let mut config = LaunchConfig::load_with_overrides(&args.config, &args.overrides)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.resume {
        config.resume = true;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let outcome = launch::run(&config, stop)?;
    if let Some(output) = &outcome.train_output {
        println!(
            "run {} finished at step {} (train_loss={:.4}); model saved to {}",
            outcome.run_id,
            output.global_step,
            output.training_loss,
            outcome.model_dir.display()
        );
    }
    Ok(())
}
