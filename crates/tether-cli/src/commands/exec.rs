//! `tether exec`: execute a command inside a running container.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tether_common::detach::DetachKeys;
use tether_runtime::container::ExecConfig;
use tether_runtime::streams::AttachStreams;

use super::Context;
use crate::host::HostContainer;
use crate::output::report_error;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Allocate a terminal session for the command.
    #[arg(short, long)]
    pub tty: bool,

    /// Keep standard input attached.
    #[arg(short, long)]
    pub interactive: bool,

    /// Forward received signals to the container.
    #[arg(long, value_name = "BOOL")]
    pub sig_proxy: Option<bool>,

    /// Key sequence that detaches from the session.
    #[arg(long, value_name = "KEYS")]
    pub detach_keys: Option<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Numeric user ID to run as.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Environment variables, as `KEY=VALUE`.
    #[arg(short, long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// PID of the container's init process.
    pub pid: u32,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command and returns the command's exit code.
///
/// Joins the target's namespaces and runs the command there, attached to
/// this process's standard streams.
///
/// # Errors
///
/// Returns an error if the detach keys are malformed.
pub async fn execute(ctx: &Context, args: ExecArgs) -> anyhow::Result<i32> {
    let keys = args.detach_keys.as_deref().unwrap_or(&ctx.config.detach_keys);
    let config = ExecConfig {
        command: args.command,
        env: args.env,
        tty: args.tty,
        workdir: args.workdir,
        user: args.user,
        detach_keys: DetachKeys::parse(keys)?,
    };
    let sig_proxy = args.sig_proxy.unwrap_or(false);
    let container = Arc::new(HostContainer::running(args.pid));

    let result = ctx
        .attacher()
        .exec(&container, &config, AttachStreams::stdio(args.interactive), sig_proxy)
        .await;
    if sig_proxy {
        ctx.rearm_shutdown();
    }

    match result {
        Ok(code) => Ok(code),
        Err(e) => {
            report_error(&e);
            Ok(e.exit_code())
        }
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}
