//! CLI command definitions and dispatch.

pub mod exec;
pub mod run;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use clap::{Parser, Subcommand};
use tether_common::config::TetherConfig;
use tether_core::signal::{HostSignals, SignalSource};
use tether_core::terminal::{HostTerminal, TerminalDevice, raw_mode_active};
use tether_runtime::attach::Attacher;
use tether_runtime::shutdown::ShutdownCoordinator;
use tether_runtime::state::StateStore;

/// tether: attach to containers with terminal and signal handling.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, global = true, env = tether_common::constants::CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Emit diagnostic logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a command as a container and attach to it.
    Run(run::RunArgs),
    /// Execute a command inside a running container.
    Exec(exec::ExecArgs),
}

/// Shared state for one CLI invocation.
pub struct Context {
    /// Effective configuration.
    pub config: TetherConfig,
    /// Host signal source.
    pub signals: Arc<dyn SignalSource>,
    /// The process's shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Attach state file.
    pub state: StateStore,
}

impl Context {
    /// Builds an orchestrator over the host terminal.
    pub fn attacher(&self) -> Attacher<HostTerminal> {
        Attacher::new(
            Arc::new(HostTerminal::new()),
            Arc::clone(&self.signals),
            Arc::clone(&self.shutdown),
        )
        .with_signal_buffer(self.config.signal_buffer)
    }

    /// Resumes shutdown handling after a proxied session released it.
    pub fn rearm_shutdown(&self) {
        if let Err(e) = self.shutdown.start() {
            tracing::warn!(error = %e, "cannot resume shutdown signal handling");
        }
    }
}

/// Dispatches the parsed CLI command to its handler, returning the exit
/// status for the process.
///
/// # Errors
///
/// Returns an error if configuration or host signal setup fails.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = match &cli.config {
        Some(path) => TetherConfig::load_from(path)?,
        None => TetherConfig::load()?,
    };
    tracing::debug!(?config, "effective configuration");

    let signals: Arc<dyn SignalSource> = Arc::new(HostSignals::new()?);
    let shutdown = Arc::new(ShutdownCoordinator::new(Arc::clone(&signals)));
    register_exit(&shutdown)?;
    shutdown.start()?;

    let state = StateStore::new(config.state_file.clone(), Arc::clone(&shutdown));
    let ctx = Context {
        config,
        signals,
        shutdown,
        state,
    };

    match cli.command {
        Command::Run(args) => run::execute(&ctx, args).await,
        Command::Exec(args) => exec::execute(&ctx, args).await,
    }
}

/// Registers the handler that ends the process on a shutdown signal.
///
/// Exits with 128 plus the signal number, after putting back the terminal
/// mode seen at startup if raw mode is still on. Handlers run in
/// registration order, so anything registered later never runs.
fn register_exit(shutdown: &Arc<ShutdownCoordinator>) -> anyhow::Result<()> {
    let terminal = HostTerminal::new();
    let startup_mode = Mutex::new(if terminal.is_terminal() {
        terminal.save_state().ok()
    } else {
        None
    });
    let coordinator: Weak<ShutdownCoordinator> = Arc::downgrade(shutdown);
    shutdown.register("exit", move || {
        if raw_mode_active() {
            let mode = startup_mode.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mode) = mode.as_ref() {
                terminal.restore(mode)?;
            }
        }
        let signal = coordinator.upgrade().and_then(|c| c.triggered_by());
        let code = signal.map_or(1, |signal| 128 + signal as i32);
        tracing::info!(?signal, code, "exiting on shutdown signal");
        std::process::exit(code);
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_trailing_command() {
        let cli = Cli::try_parse_from(["tether", "run", "-it", "--sig-proxy", "false", "sh", "-c", "exit 3"])
            .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.tty);
        assert!(args.interactive);
        assert_eq!(args.sig_proxy, Some(false));
        assert_eq!(args.command, ["sh", "-c", "exit 3"]);
    }

    #[test]
    fn exec_takes_pid_then_command() {
        let cli = Cli::try_parse_from(["tether", "exec", "-e", "A=1", "4242", "ls", "-l"]).unwrap();
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.pid, 4242);
        assert_eq!(args.env, [("A".to_owned(), "1".to_owned())]);
        assert_eq!(args.command, ["ls", "-l"]);
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["tether", "run", "-d"]).is_err());
    }
}
