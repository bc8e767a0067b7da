//! Gridplan Command-Line Interface
//!
//! Plans Slurm submissions for a cluster described in YAML: picks a queue,
//! resolves accelerator classes and writes the batch wrapper script.
//!
//! ```text
//! gridplan --config cluster.yml plan -R 20 -T 30 ./analyse.sh subject01
//! gridplan --config cluster.yml script -o job.sh --coprocessor cuda ./train.py
//! gridplan --config cluster.yml queues
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::common::JobArgs;
use commands::{plan, queues, script, version};

/// Gridplan - queue matching and Slurm submission planning
#[derive(Parser)]
#[command(name = "gridplan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Cluster configuration file
    #[arg(short, long, env = "GRIDPLAN_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose a queue and show the submission plan
    Plan {
        #[command(flatten)]
        job: JobArgs,

        /// Print the full plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate the Slurm wrapper script
    Script {
        #[command(flatten)]
        job: JobArgs,

        /// Write the script to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List configured queues, including synthesised compound queues
    Queues {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Execute command
    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Plan { job, json } => plan::execute(config, &job, json),
        Commands::Script { job, output } => script::execute(config, &job, output.as_deref()),
        Commands::Queues { json } => queues::execute(config, json),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
