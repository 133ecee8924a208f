mod completion;
mod render;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shipit_core::resolve;
use shipit_installer::{read_all_install_states, validate, InstallStatus, SwapEngine};
use shipit_service::{submit, InstallerService, ResultMessage, ServiceConfig, WireRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::completion::{write_completions_script, CliCompletionShell};
use crate::render::TerminalRenderer;

#[derive(Parser, Debug)]
#[command(name = "shipit")]
#[command(about = "Crash-safe application bundle installer", long_about = None)]
struct Cli {
    /// Service configuration file (default: <state_dir>/shipit.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Installer socket, overriding the configuration.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the resident installer service.
    Serve,
    /// Ask the service to replace an installed bundle with a staged update.
    Install {
        target: PathBuf,
        staged: PathBuf,
        #[arg(long)]
        relaunch: bool,
        /// Keep installing if this command exits before the result arrives.
        #[arg(long)]
        survive_disconnect: bool,
        /// Print the terminal result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Settle installs interrupted by a crash, without a running service.
    Recover,
    /// List installs that have not reached a settled state.
    Status,
    /// Show the identity and digest of a bundle.
    Inspect { bundle: PathBuf },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Serve => {
            let config = load_config(&cli.config, &cli.socket)?;
            init_tracing(&config.log_filter);
            info!(version = env!("CARGO_PKG_VERSION"), "shipit service starting");

            let service = Arc::new(InstallerService::new(config)?);
            service.recover_pending()?;
            let listener = service.bind()?;
            Arc::clone(&service).serve(listener, shutdown_signal()).await?;
            info!("shipit service stopped");
        }
        Commands::Install {
            target,
            staged,
            relaunch,
            survive_disconnect,
            json,
        } => {
            init_tracing("warn");
            let config = load_config(&cli.config, &cli.socket)?;
            let socket = config.socket_path()?;
            let request = WireRequest {
                target_bundle_path: absolute_path(&target)?,
                staged_update_path: absolute_path(&staged)?,
                should_relaunch: relaunch,
                survive_disconnect,
            };

            let renderer = TerminalRenderer::current();
            let mut progress = renderer.start_phase_progress("connecting");
            let outcome = submit(&socket, &request, |phase| progress.set_phase(phase)).await;
            let result = match outcome {
                Ok(result) => {
                    progress.finish();
                    result
                }
                Err(err) => {
                    progress.abandon();
                    return Err(err);
                }
            };

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).context("failed to encode result")?
                );
            } else {
                renderer.print_result(&result);
            }
            return Ok(exit_code_for(result.status));
        }
        Commands::Recover => {
            init_tracing("warn");
            let config = load_config(&cli.config, &cli.socket)?;
            let engine = SwapEngine::new(config.layout()?, config.swap_options())?;
            let renderer = TerminalRenderer::current();

            let results = engine.recover()?;
            if results.is_empty() {
                renderer.print_status("ok", "no interrupted installs");
            }
            let mut code = ExitCode::SUCCESS;
            for result in &results {
                if result.status == InstallStatus::Failed {
                    code = exit_code_for(result.status);
                }
                renderer.print_result(&ResultMessage::from(result));
            }
            return Ok(code);
        }
        Commands::Status => {
            init_tracing("warn");
            let config = load_config(&cli.config, &cli.socket)?;
            let layout = config.layout()?;
            let renderer = TerminalRenderer::current();

            let states = read_all_install_states(&layout)?;
            if states.is_empty() {
                renderer.print_status("ok", "no pending installs");
            }
            for state in states {
                renderer.print_status(
                    "warn",
                    &format!(
                        "{} {} -> {} ({})",
                        state.txid,
                        state.target_path.display(),
                        state.expected_identity.version_label(),
                        state.current_phase
                    ),
                );
                if let Some(error) = state.last_error {
                    println!("  last error: {error}");
                }
                if let Some(backup) = state.backup_path {
                    println!("  backup: {}", backup.display());
                }
            }
        }
        Commands::Inspect { bundle } => {
            init_tracing("warn");
            let bundle = absolute_path(&bundle)?;
            let renderer = TerminalRenderer::current();

            let identity = resolve(&bundle)?;
            println!("identifier: {}", identity.bundle_identifier);
            println!("version: {}", identity.version_label());
            println!("executable: {}", identity.executable_path.display());
            match validate(&bundle) {
                Ok(stage) => {
                    println!("digest: {}", stage.digest);
                    renderer.print_status("ok", "bundle is installable");
                }
                Err(err) => {
                    renderer.print_status("err", &format!("{}: {err}", err.kind()));
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(shell, &mut stdout)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(config: &Option<PathBuf>, socket: &Option<PathBuf>) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load(config.as_deref())?;
    if let Some(socket) = socket {
        config.socket_path = Some(socket.clone());
    }
    Ok(config)
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// The service knows neither this shell's working directory nor how its `..`
/// components resolve, so the parent directory is resolved here.
fn absolute_path(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = std::env::current_dir().context("failed to resolve current directory")?;
        cwd.join(path)
    };
    let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) else {
        return Ok(joined);
    };
    match std::fs::canonicalize(parent) {
        Ok(parent) => Ok(parent.join(name)),
        Err(_) => Ok(joined),
    }
}

fn exit_code_for(status: InstallStatus) -> ExitCode {
    match status {
        InstallStatus::Success => ExitCode::SUCCESS,
        InstallStatus::Failed => ExitCode::from(1),
        InstallStatus::RolledBack => ExitCode::from(2),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests;
