use crate::demo::{run_demo, run_sweep_once, DemoArgs, SweepArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use coop_loans::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Cooperative Loan Orchestrator",
    about = "Run the cooperative loan group workflow service or walk through it from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service with the background sweep (default command)
    Serve(ServeArgs),
    /// Run one reminder/expiry sweep over a seeded in-memory store and print the report
    Sweep(SweepArgs),
    /// Walk a loan group from enrollment to finance review and expiry
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Do not start the periodic reminder/expiry sweep
    #[arg(long)]
    pub(crate) no_sweep: bool,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sweep(args) => run_sweep_once(args),
        Command::Demo(args) => run_demo(args),
    }
}
