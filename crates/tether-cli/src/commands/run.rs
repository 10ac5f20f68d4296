//! `tether run`: start a command as a container and attach to it.

use std::sync::Arc;

use clap::Args;
use tether_common::constants::EXIT_CODE_ENGINE;
use tether_common::detach::DetachKeys;
use tether_common::types::ContainerState;
use tether_runtime::attach::{AttachOptions, AttachOutcome};
use tether_runtime::container::Container;
use tether_runtime::state::StateEntry;
use tether_runtime::streams::AttachStreams;

use super::Context;
use crate::host::HostContainer;
use crate::output::report_error;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Allocate a terminal session for the container.
    #[arg(short, long)]
    pub tty: bool,

    /// Keep standard input attached.
    #[arg(short, long)]
    pub interactive: bool,

    /// Start the container in the background and print its ID.
    #[arg(short, long)]
    pub detach: bool,

    /// Forward received signals to the container.
    #[arg(long, value_name = "BOOL")]
    pub sig_proxy: Option<bool>,

    /// Key sequence that detaches from the container.
    #[arg(long, value_name = "KEYS")]
    pub detach_keys: Option<String>,

    /// Command and arguments to run.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command and returns the container's exit code.
///
/// # Errors
///
/// Returns an error if the detach keys are malformed.
pub async fn execute(ctx: &Context, args: RunArgs) -> anyhow::Result<i32> {
    if args.detach && args.sig_proxy == Some(true) {
        report_error(&std::io::Error::other(
            "you cannot use --sig-proxy with --detach",
        ));
        return Ok(EXIT_CODE_ENGINE);
    }
    let keys = args.detach_keys.as_deref().unwrap_or(&ctx.config.detach_keys);
    let options = AttachOptions {
        detach_keys: DetachKeys::parse(keys)?,
        sig_proxy: !args.detach && args.sig_proxy.unwrap_or(ctx.config.sig_proxy),
    };
    let streams = if args.detach {
        AttachStreams::default()
    } else {
        AttachStreams::stdio(args.interactive)
    };

    let container = Arc::new(HostContainer::spawn(args.command, args.tty));
    record(ctx, &container, ContainerState::Created).await;
    let result = ctx
        .attacher()
        .start_and_attach(&container, streams, &options, true)
        .await;
    if options.sig_proxy {
        ctx.rearm_shutdown();
    }

    match result {
        Ok(report) => {
            let code = match report.outcome {
                AttachOutcome::Completed => container.exit_code().unwrap_or(0),
                AttachOutcome::Detached | AttachOutcome::Started => 0,
            };
            record(ctx, &container, state_after(report.outcome)).await;
            tracing::info!(id = %report.id, outcome = ?report.outcome, code, "run finished");
            Ok(code)
        }
        Err(e) => {
            if container.pid().is_some() {
                record(ctx, &container, ContainerState::Exited).await;
            }
            report_error(&e);
            Ok(e.exit_code())
        }
    }
}

/// State of the container once the attach call has returned.
const fn state_after(outcome: AttachOutcome) -> ContainerState {
    match outcome {
        AttachOutcome::Completed => ContainerState::Exited,
        AttachOutcome::Detached | AttachOutcome::Started => ContainerState::Running,
    }
}

async fn record(ctx: &Context, container: &HostContainer, state: ContainerState) {
    let entry = StateEntry::new(container.id().clone(), state, container.pid());
    if let Err(e) = ctx.state.record(entry).await {
        tracing::warn!(id = %container.id(), error = %e, "cannot record container state");
    }
}
