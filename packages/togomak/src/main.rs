//! togomak: a declarative CI/CD pipeline runner.

mod cli;
mod commands;

use clap::Parser;
use cli::{CacheCommand, Cli, Command};
use tracing_subscriber::EnvFilter;

fn init_logging(global: &cli::GlobalArgs) {
    let level = match global.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("togomak={0},togomak_engine={0},togomak_expr={0}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if global.json_log {
        builder.json().init();
    } else if global.child {
        // Child invocations nest inside a parent stage's log stream; drop
        // the timestamps and force colors so they read as one stream.
        builder.without_time().with_ansi(true).init();
    } else if global.ci {
        builder.with_ansi(true).init();
    } else {
        builder.init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.global);

    let code = match &cli.command {
        None => run_async(commands::run(&cli.global, &cli.stages)),
        Some(Command::Run { stages }) => run_async(commands::run(&cli.global, stages)),
        Some(Command::Init) => commands::init(&cli.global),
        Some(Command::List) => commands::list(&cli.global),
        Some(Command::Fmt { check, recursive }) => commands::fmt(&cli.global, *check, *recursive),
        Some(Command::Cache {
            command: CacheCommand::Clean { recursive },
        }) => commands::cache_clean(&cli.global, *recursive),
    };

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run_async(fut: impl std::future::Future<Output = anyhow::Result<i32>>) -> anyhow::Result<i32> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start async runtime")
        .block_on(fut)
}
