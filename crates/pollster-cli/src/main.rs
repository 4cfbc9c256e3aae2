use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "pollster", version, about = "Pollster CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll management
    Poll {
        #[command(subcommand)]
        action: commands::poll::PollAction,
    },
    /// Vote on an active poll
    Vote(commands::vote::VoteArgs),
    /// List active polls
    Feed,
    /// Run the scheduler workers until Ctrl-C
    Run(commands::run::RunArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Poll { action } => commands::poll::run(action).await,
        Commands::Vote(args) => commands::vote::run(args).await,
        Commands::Feed => commands::feed::run().await,
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
