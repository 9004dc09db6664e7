use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use scalar_runner::config::RunnerConfig;
use scalar_runner::{describe, read_inputs, score_inputs, validation_pipeline, FunctionSummary};
use scoring::TaskPipeline;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runner config (TOML). Falls back to SCALAR_BACKEND_URL when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and statically check a function file
    Validate { function: PathBuf },
    /// Print a function's tasks, members and execution waves
    Inspect { function: PathBuf },
    /// Score inputs (JSON array, object or JSON lines) and print results
    Score {
        function: PathBuf,
        inputs: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    match args.command {
        Command::Validate { function } => {
            let function = scoring::load(&function)?;
            let pipeline = validation_pipeline(args.config.as_deref())?;
            let summary = FunctionSummary::new(&function, pipeline.as_ref());
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.missing_backends.is_empty() {
                bail!("unconfigured backends: {}", summary.missing_backends.join(", "));
            }
        }
        Command::Inspect { function } => {
            let function = scoring::load(&function)?;
            print!("{}", describe(&function));
        }
        Command::Score { function, inputs } => {
            let function = scoring::load(&function)?;
            let inputs = read_inputs(&inputs)?;
            let config = RunnerConfig::resolve(args.config.as_deref())?;
            let pipeline = TaskPipeline::new(config.build_backends()?, config.engine.clone())?;

            let missing = pipeline.missing_backends(&function);
            if !missing.is_empty() {
                bail!("unconfigured backends: {}", missing.join(", "));
            }

            info!(function = %function.name, inputs = inputs.len(), "scoring");
            let records = score_inputs(&pipeline, &function, inputs).await;
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
            let failed = records.iter().filter(|r| r.is_failed()).count();
            if failed > 0 {
                bail!("{failed} of {} inputs failed", records.len());
            }
        }
    }

    Ok(())
}
