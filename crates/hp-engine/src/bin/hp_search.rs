//! Hyperparameter search over a pool of training processes.
//!
//! Usage:
//!   hp-search --config search.json
//!   hp-search --num-instances 4 --resume results.csv
//!   RUST_LOG=debug hp-search --print-config

use std::path::PathBuf;

use clap::Parser;
use hp_engine::{ProcessSpawner, SchedulerEvent, SearchConfig, StopReason};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hp-search")]
#[command(about = "Run a Bayesian hyperparameter search over a pool of training instances")]
struct Args {
    /// JSON config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent training instances
    #[arg(short = 'n', long)]
    num_instances: Option<usize>,

    /// Seconds between pool polls
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Optimizer RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many completed trials
    #[arg(long)]
    max_trials: Option<usize>,

    /// Replay observations from this CSV file before searching
    #[arg(long)]
    resume: Option<PathBuf>,

    /// CSV file observations are appended to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the effective config as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn search_config(&self) -> anyhow::Result<SearchConfig> {
        let mut config = match &self.config {
            Some(path) => SearchConfig::from_file(path)?,
            None => SearchConfig::default(),
        };
        if let Some(n) = self.num_instances {
            config = config.with_num_instances(n);
        }
        if let Some(secs) = self.interval_secs {
            config = config.with_poll_interval_secs(secs);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if let Some(n) = self.max_trials {
            config = config.with_max_trials(n);
        }
        if let Some(path) = &self.resume {
            config = config.with_resume_from(path);
        }
        if let Some(path) = &self.output {
            config = config.with_output_file(path);
        }
        config.validate()?;
        Ok(config)
    }
}

fn report(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TrialStarted { slot, pid, .. } => {
            if let Some(pid) = pid {
                println!("Training started in slot {slot} with PID: {pid}");
            }
        }
        SchedulerEvent::ObservationRecorded { observation, .. } => {
            println!("instance_params: {}", observation.candidate);
            println!("instance_result: {}", observation.score);
        }
        SchedulerEvent::TrialTerminated(record) => println!("{record}"),
        SchedulerEvent::LaunchFailed { slot, error, .. } => {
            eprintln!("Slot {slot} failed to launch: {error}");
        }
        SchedulerEvent::TrialFailed {
            slot, exit_code, ..
        } => {
            eprintln!("Slot {slot} trial exited with {exit_code:?}");
        }
        SchedulerEvent::PersistFailed { error } => {
            eprintln!("Could not save results: {error}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = args.search_config()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut scheduler = config.build_scheduler(ProcessSpawner)?;
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c, running until the budget is spent");
            std::future::pending::<()>().await;
        }
    };

    let reason = scheduler
        .run(config.poll_interval(), interrupt, report)
        .await;

    let status = scheduler.status();
    match reason {
        StopReason::Interrupted => println!("Interrupted, all instances stopped"),
        StopReason::BudgetExhausted => println!("Trial budget spent, all instances stopped"),
    }
    println!(
        "Completed {} trials ({} failed, {} launch failures)",
        status.trials_completed, status.trials_failed, status.launch_failures
    );
    if let Some(best) = &status.best {
        println!("Best: {} -> {}", best.candidate, best.score);
    }
    Ok(())
}
