use anyhow::{Context, Result};
use auth_perms::PermsConfig;
use clap::Parser;
use colored::*;
use ops_cli::{commands, Cli, Command, Store, EXIT_ERROR};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match PermsConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "error".bright_red(), e);
            return ExitCode::from(EXIT_ERROR);
        }
    };

    init_tracing(cli.verbose, &config.log_level);
    debug!(max_depth = config.max_depth, "Configuration loaded");

    match run(cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}: {:#}", "error".bright_red(), e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// `-v` forces debug; otherwise `RUST_LOG`, then the configured level.
fn init_tracing(verbose: bool, log_level: &str) {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli, config: PermsConfig) -> Result<u8> {
    let store = Store::open(cli.fixture.as_deref(), &config)
        .await
        .context("Failed to open permission store")?;
    let resolver = store.resolver(&config);

    match cli.command {
        Command::Check {
            principal,
            permission,
            object,
            explain,
        } => {
            let verdict =
                commands::check(&resolver, &principal, &permission, object.as_deref(), explain).await?;
            let line = verdict.render();
            if verdict.exit_code() == 0 {
                println!("{}", line.bright_green());
            } else {
                println!("{}", line.bright_red());
            }
            Ok(verdict.exit_code())
        }
        Command::Groups { node } => {
            for group in commands::groups(&resolver, &node).await? {
                println!("{}", group);
            }
            Ok(0)
        }
        Command::Validate => {
            let counts = commands::validate(&store).await?;
            println!("{}", counts);
            Ok(0)
        }
    }
}
