//! CLI for runtrack: dry-run the gate and inspect what the shim would record.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "runtrack")]
#[command(about = "runtrack: job instrumentation diagnostics")]
#[command(version = runtrack_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Variant {
    Preload,
    Static,
}

impl From<Variant> for runtrack_core::BuildVariant {
    fn from(v: Variant) -> Self {
        match v {
            Variant::Preload => Self::Preload,
            Variant::Static => Self::Static,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the gate against the current environment without side effects
    Check {
        /// Executable to classify (defaults to this binary)
        #[arg(long)]
        exec: Option<String>,

        /// Build variant to evaluate as
        #[arg(long, value_enum, default_value = "preload")]
        variant: Variant,

        /// Print the decision as JSON
        #[arg(long)]
        json: bool,
    },

    /// Look up the sampling probability for a runtime
    Sample {
        /// Run time in seconds
        #[arg(long)]
        runtime: f64,

        /// Fixed draw in [0, 1); a fresh one is drawn when omitted
        #[arg(long)]
        draw: Option<f64>,

        /// Table as "lower:prob,..." (defaults to RUNTRACK_SAMPLING_TABLE or the built-in table)
        #[arg(long)]
        table: Option<String>,
    },

    /// Show the JSON and transport payload built from a command line
    Argv {
        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Arguments, after `--`
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Decode a transport payload back into its argument list
    Decode {
        /// Base64 payload as passed to the recorder after `--`
        payload: String,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            exec,
            variant,
            json,
        } => commands::check::run(exec.as_deref(), variant.into(), json),
        Commands::Sample {
            runtime,
            draw,
            table,
        } => commands::sample::run(runtime, draw, table.as_deref()),
        Commands::Argv { json, args } => commands::argv::run(&args, json),
        Commands::Decode { payload } => commands::decode::run(&payload),
    }
}
