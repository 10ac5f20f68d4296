//! Host processes as attachable containers.
//!
//! [`HostContainer`] lets the CLI drive the attach runtime against plain
//! processes: `tether run` starts a command in its own process group and
//! attaches to it, `tether exec` enters the namespaces of a running PID
//! with `nsenter`. Streams are piped, so the detach sequence can be
//! recognised on the way in. Host processes have no pseudo-terminal;
//! resize events are only logged.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tether_common::constants::EXIT_CODE_ENGINE;
use tether_common::detach::DetachKeys;
use tether_common::error::TetherError;
use tether_common::types::ContainerId;
use tether_core::io::{CopyError, copy_detachable};
use tether_runtime::container::{AttachDone, Container, ContainerError, ExecConfig, ResizeEvents};
use tether_runtime::streams::AttachStreams;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A process on this host, treated as a container's init process.
#[derive(Debug)]
pub struct HostContainer {
    id: ContainerId,
    tty: bool,
    command: Vec<String>,
    pid: OnceLock<u32>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<OnceLock<i32>>,
}

impl HostContainer {
    /// A container that runs `command` once started.
    #[must_use]
    pub fn spawn(command: Vec<String>, tty: bool) -> Self {
        Self {
            id: ContainerId::generate(),
            tty,
            command,
            pid: OnceLock::new(),
            exited: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(OnceLock::new()),
        }
    }

    /// A container whose init process is already running as `pid`.
    #[must_use]
    pub fn running(pid: u32) -> Self {
        let container = Self {
            id: ContainerId::new(format!("pid-{pid}")),
            tty: false,
            command: Vec::new(),
            pid: OnceLock::new(),
            exited: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(OnceLock::new()),
        };
        let _ = container.pid.set(pid);
        container
    }

    /// PID of the init process, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Exit code of the init process, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    fn not_running(&self, reason: &str) -> ContainerError {
        ContainerError::InvalidState {
            id: self.id.clone(),
            reason: reason.to_owned(),
        }
    }

    fn running_pid(&self) -> Result<Pid, ContainerError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(self.not_running("container has exited"));
        }
        let pid = self
            .pid
            .get()
            .ok_or_else(|| self.not_running("container has not been started"))?;
        let raw = i32::try_from(*pid).map_err(|_| self.not_running("PID out of range"))?;
        Ok(Pid::from_raw(raw))
    }
}

impl Container for HostContainer {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn has_tty(&self) -> bool {
        self.tty
    }

    async fn kill(&self, signal: Signal) -> Result<(), ContainerError> {
        let pid = self.running_pid()?;
        match nix::sys::signal::kill(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                self.exited.store(true, Ordering::SeqCst);
                Err(self.not_running("container process no longer exists"))
            }
            Err(Errno::EPERM) => Err(ContainerError::PermissionDenied {
                message: format!("signal {signal} to PID {pid}"),
            }),
            Err(errno) => Err(ContainerError::Runtime(TetherError::Os {
                facility: "signal delivery",
                source: errno.into(),
            })),
        }
    }

    async fn exec(
        &self,
        config: &ExecConfig,
        streams: AttachStreams,
        resize: Option<ResizeEvents>,
    ) -> Result<i32, ContainerError> {
        let target = self.running_pid()?;
        let mut command = nsenter(target, config)?;
        stdio(&mut command, &streams);
        tracing::info!(id = %self.id, pid = %target, cmd = ?config.command, "exec into container");

        let mut child = command.spawn()?;
        let wiring = wire(&mut child, streams, &config.detach_keys, resize);
        let status = supervise(child, wiring).await?;
        Ok(exit_code(status))
    }

    async fn attach(
        &self,
        streams: AttachStreams,
        detach_keys: &DetachKeys,
        resize: Option<ResizeEvents>,
        start: bool,
    ) -> Result<AttachDone, ContainerError> {
        if !start || self.pid.get().is_some() {
            return Err(self.not_running("host processes can only be attached as they start"));
        }
        let (program, args) = self.command.split_first().ok_or_else(|| {
            ContainerError::Runtime(TetherError::Config {
                message: "no command to run".into(),
            })
        })?;
        let mut command = Command::new(program);
        let _ = command.args(args).process_group(0);
        stdio(&mut command, &streams);

        let mut child = command.spawn()?;
        if let Some(pid) = child.id() {
            let _ = self.pid.set(pid);
        }
        tracing::info!(id = %self.id, pid = ?child.id(), cmd = ?self.command, "started container");

        let wiring = wire(&mut child, streams, detach_keys, resize);
        let exited = Arc::clone(&self.exited);
        let exit_code_slot = Arc::clone(&self.exit_code);
        let id = self.id.clone();
        let (report, done) = oneshot::channel();
        let _ = tokio::spawn(async move {
            let result = supervise(child, wiring).await.map(|status| {
                let code = exit_code(status);
                exited.store(true, Ordering::SeqCst);
                let _ = exit_code_slot.set(code);
                tracing::info!(id = %id, code, "container exited");
            });
            let _ = report.send(result);
        });
        Ok(done)
    }
}

fn nsenter(target: Pid, config: &ExecConfig) -> Result<Command, ContainerError> {
    if config.command.is_empty() {
        return Err(ContainerError::Runtime(TetherError::Config {
            message: "exec command is empty".into(),
        }));
    }
    let mut command = Command::new("nsenter");
    let _ = command.args([
        "--target",
        &target.to_string(),
        "--mount",
        "--uts",
        "--ipc",
        "--net",
        "--pid",
    ]);
    if let Some(workdir) = &config.workdir {
        let _ = command.arg(format!("--wd={}", workdir.display()));
    }
    if let Some(user) = &config.user {
        let uid: u32 = user.parse().map_err(|_| {
            ContainerError::Runtime(TetherError::Config {
                message: format!("exec user must be a numeric UID, got {user:?}"),
            })
        })?;
        let _ = command.args(["--setuid", &uid.to_string(), "--setgid", &uid.to_string()]);
    }
    let _ = command.arg("--").args(&config.command).envs(config.env.iter().cloned());
    Ok(command)
}

fn stdio(command: &mut Command, streams: &AttachStreams) {
    let pipe = |attached: bool| if attached { Stdio::piped() } else { Stdio::null() };
    let _ = command
        .stdin(pipe(streams.attach_input()))
        .stdout(pipe(streams.attach_output()))
        .stderr(pipe(streams.attach_error()));
}

/// Copy tasks connecting a child to its attach streams.
struct Wiring {
    detached: oneshot::Receiver<()>,
    input: Option<JoinHandle<()>>,
    outputs: Vec<JoinHandle<()>>,
}

fn wire(
    child: &mut Child,
    streams: AttachStreams,
    detach_keys: &DetachKeys,
    resize: Option<ResizeEvents>,
) -> Wiring {
    let (input, output, error) = streams.into_parts();
    let (detach, detached) = oneshot::channel();

    let input = match (input, child.stdin.take()) {
        (Some(mut from), Some(mut to)) => {
            let keys = detach_keys.as_bytes().to_vec();
            Some(tokio::spawn(async move {
                match copy_detachable(&mut from, &mut to, &keys).await {
                    Ok(_) => {}
                    Err(CopyError::Detached) => {
                        let _ = detach.send(());
                    }
                    Err(CopyError::Io(e)) => tracing::debug!(error = %e, "container input closed"),
                }
            }))
        }
        _ => None,
    };

    let mut outputs = Vec::new();
    if let (Some(mut to), Some(mut from)) = (output, child.stdout.take()) {
        outputs.push(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
                tracing::debug!(error = %e, "container output closed");
            }
            let _ = to.flush().await;
        }));
    }
    if let (Some(mut to), Some(mut from)) = (error, child.stderr.take()) {
        outputs.push(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
                tracing::debug!(error = %e, "container error output closed");
            }
            let _ = to.flush().await;
        }));
    }

    if let Some(mut events) = resize {
        let _ = tokio::spawn(async move {
            while let Some(size) = events.recv().await {
                tracing::debug!(%size, "terminal resized, host process has no pty");
            }
        });
    }

    Wiring {
        detached,
        input,
        outputs,
    }
}

/// Waits for `child` to exit or for the user to detach.
async fn supervise(mut child: Child, mut wiring: Wiring) -> Result<ExitStatus, ContainerError> {
    let status = tokio::select! {
        status = child.wait() => status?,
        Ok(()) = &mut wiring.detached => {
            tracing::debug!(pid = ?child.id(), "detached, leaving process running");
            return Err(ContainerError::Detached);
        }
    };
    for output in wiring.outputs {
        let _ = output.await;
    }
    if let Some(input) = wiring.input {
        input.abort();
    }
    Ok(status)
}

/// Maps an exit status to a shell-style code: the exit code, or 128 plus
/// the terminating signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_CODE_ENGINE)
}
