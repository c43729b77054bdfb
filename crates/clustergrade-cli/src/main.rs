//! clustergrade entry point.
//!
//! Binary name: `clustergrade`
//!
//! Parses CLI arguments, sets up tracing into the log directory, then
//! dispatches to the command handler. Errors are printed with the next
//! action the operator should take, when one is known.

mod cli;
mod gate;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clustergrade_core::hub::{HubOptions, NextActionError};
use clustergrade_types::error::ConnectError;
use console::style;

use cli::{Cli, Commands, ConfigCommand};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let state = AppState::resolve(cli.verbose, cli.non_interactive);

    let _guard = match clustergrade_observe::init_tracing(cli.verbose, Some(state.log_dir.as_path()), cli.otel) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("  {} logging to {} is disabled: {e}", style("!").yellow(), state.log_dir.display());
            None
        }
    };

    let result = run(cli, &state).await;
    clustergrade_observe::shutdown_tracing();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!();
            eprintln!("{} {err:#}", style("Error:").red().bold());
            if let Some(next_action) = next_action(&err) {
                eprintln!();
                eprintln!("{}", style(next_action).yellow());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, state: &AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Initialize(args) => cli::step::initialize(state, args, cli.jobs).await,

        Commands::Execute {
            pg_upgrade_verbose,
            skip_pg_upgrade_checks,
        } => {
            let options = HubOptions {
                pg_upgrade_verbose,
                skip_pg_upgrade_checks,
            };
            cli::step::execute(state, options).await
        }

        Commands::Finalize => cli::step::finalize(state).await,

        Commands::Revert => cli::step::revert(state).await,

        Commands::Apply {
            gphome,
            port,
            input_dir,
            phase,
        } => cli::apply::apply(state, &gphome, port, &input_dir, &phase, cli.jobs).await,

        Commands::Status { json } => cli::status::status(state, json).await,

        Commands::Config {
            action: ConfigCommand::Show { key },
        } => cli::config::show(state, key.as_deref()).await,

        Commands::KillServices => cli::step::kill_services(state).await,

        Commands::Version => {
            println!("clustergrade {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Remediation attached anywhere in the error chain.
fn next_action(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<NextActionError>() {
            return Some(e.next_action.clone());
        }
        cause.downcast_ref::<ConnectError>().and_then(ConnectError::next_action)
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn next_action_is_found_through_context() {
        let err = anyhow::Error::new(NextActionError {
            error: anyhow::anyhow!("source cluster has active connections"),
            next_action: "Stop the connections and re-run execute.".to_string(),
        })
        .context("execute failed");
        assert_eq!(
            next_action(&err).as_deref(),
            Some("Stop the connections and re-run execute.")
        );
    }

    #[test]
    fn plain_errors_have_no_next_action() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("boom")).context("finalize failed");
        assert!(next_action(&err.unwrap_err()).is_none());
    }
}
