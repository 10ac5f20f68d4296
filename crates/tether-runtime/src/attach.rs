//! The attach orchestrator.
//!
//! An [`Attacher`] drives one exec or attach call against a container:
//!
//! 1. decide whether the session is interactive (the local input is a
//!    terminal and the container asked for a TTY);
//! 2. if so, enter a [`TerminalSession`] and hand its resize stream to the
//!    container;
//! 3. optionally proxy host signals to the container;
//! 4. invoke the container and wait for the session to end.
//!
//! The terminal session and the proxy are owned by the call. Whatever way
//! the call ends, including an error, a panic, or the future being
//! dropped, the resize watcher is cancelled and the terminal restored.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tether_common::constants::{EXIT_CODE_CANNOT_INVOKE, EXIT_CODE_ENGINE, EXIT_CODE_NOT_FOUND};
use tether_common::detach::DetachKeys;
use tether_common::types::ContainerId;
use tether_core::signal::SignalSource;
use tether_core::terminal::TerminalDevice;
use thiserror::Error;

use crate::container::{Container, ContainerError, ExecConfig, ResizeEvents};
use crate::shutdown::ShutdownCoordinator;
use crate::sigproxy::{ProxyError, ProxyExit, ProxySession, SignalProxy};
use crate::streams::AttachStreams;
use crate::terminal::{TerminalError, TerminalSession};

/// Errors ending an attach or exec call.
#[derive(Debug, Error)]
pub enum AttachError {
    /// The local terminal could not be prepared or restored.
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    /// Signal proxying could not be started.
    #[error(transparent)]
    SignalProxy(#[from] ProxyError),

    /// The container call failed.
    #[error("{operation} failed for container {id}: {source}")]
    Invocation {
        /// Call that failed, `exec` or `attach`.
        operation: &'static str,
        /// Container the call targeted.
        id: ContainerId,
        /// Underlying failure.
        #[source]
        source: ContainerError,
    },

    /// The container ID of a detached session could not be reported.
    #[error("cannot report container ID: {0}")]
    Report(#[source] std::io::Error),
}

impl AttachError {
    /// Returns the process exit status matching this error.
    ///
    /// A detach is not a failure and maps to 0. A failed invocation maps
    /// to 127 when the command does not exist and 126 otherwise. Every
    /// other failure is an engine failure, 125.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Invocation { source, .. } => match source {
                ContainerError::Detached => 0,
                ContainerError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    EXIT_CODE_NOT_FOUND
                }
                _ => EXIT_CODE_CANNOT_INVOKE,
            },
            Self::Terminal(_) | Self::SignalProxy(_) | Self::Report(_) => EXIT_CODE_ENGINE,
        }
    }
}

/// Per-call attach settings.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Sequence that detaches from the container.
    pub detach_keys: DetachKeys,
    /// Whether host signals are forwarded to the container.
    pub sig_proxy: bool,
}

/// How an attach session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The container's session finished.
    Completed,
    /// The user typed the detach sequence.
    Detached,
    /// No output was attached; the container was left running and its ID
    /// reported.
    Started,
}

/// Result of a successful [`Attacher::start_and_attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReport {
    /// The container attached to.
    pub id: ContainerId,
    /// How the session ended.
    pub outcome: AttachOutcome,
    /// How signal forwarding ended, if it ran.
    pub proxy: Option<ProxyExit>,
}

/// Runs exec and attach calls against containers.
pub struct Attacher<T: TerminalDevice> {
    terminal: Arc<T>,
    signals: Arc<dyn SignalSource>,
    proxy: SignalProxy,
    report: Mutex<Box<dyn Write + Send>>,
}

impl<T: TerminalDevice> Attacher<T> {
    /// Creates an orchestrator for `terminal`. Detached container IDs are
    /// reported on standard output.
    #[must_use]
    pub fn new(
        terminal: Arc<T>,
        signals: Arc<dyn SignalSource>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let proxy = SignalProxy::new(Arc::clone(&signals), shutdown);
        Self {
            terminal,
            signals,
            proxy,
            report: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Sets the capacity of the signal proxy's queue.
    #[must_use]
    pub fn with_signal_buffer(mut self, buffer: usize) -> Self {
        self.proxy = self.proxy.with_buffer(buffer);
        self
    }

    /// Redirects detached-session reports to `writer`.
    #[must_use]
    pub fn with_report_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.report = Mutex::new(Box::new(writer));
        self
    }

    /// Runs `config` in `container` and returns the command's exit code.
    ///
    /// A user detach counts as success with exit code 0. When neither
    /// output nor error is attached, the container ID and a newline are
    /// written to the report writer once the command has run.
    ///
    /// # Errors
    ///
    /// - [`AttachError::Terminal`] if the terminal cannot be prepared; the
    ///   container is not touched.
    /// - [`AttachError::SignalProxy`] if proxying was requested and cannot
    ///   start.
    /// - [`AttachError::Invocation`] if the exec call fails.
    /// - [`AttachError::Report`] if the detached report cannot be written.
    pub async fn exec<C: Container>(
        &self,
        container: &Arc<C>,
        config: &ExecConfig,
        streams: AttachStreams,
        sig_proxy: bool,
    ) -> Result<i32, AttachError> {
        let id = container.id().clone();
        let background = streams.is_detached();
        let mut session = self.begin_terminal(config.tty)?;
        let resize = take_resize(session.as_mut());
        let proxy = self.start_proxy(container, sig_proxy).await?;

        tracing::debug!(id = %id, command = ?config.command, tty = session.is_some(), "executing in container");
        let outcome = container.exec(config, streams, resize).await;

        let _ = stop_proxy(proxy).await;
        let restored = end_terminal(session);
        let code = match outcome {
            Ok(code) => code,
            Err(e) if e.is_detached() => {
                tracing::info!(id = %id, "detached from exec session");
                0
            }
            Err(source) => {
                return Err(AttachError::Invocation {
                    operation: "exec",
                    id,
                    source,
                });
            }
        };
        restored?;

        if background {
            self.report_id(&id)?;
        }
        Ok(code)
    }

    /// Attaches `streams` to `container`, starting it first when `start`
    /// is set, and waits for the session to end.
    ///
    /// When neither output nor error is attached the call returns as soon
    /// as the container is attached, after writing its ID and a newline to
    /// the report writer.
    ///
    /// # Errors
    ///
    /// - [`AttachError::Terminal`] if the terminal cannot be prepared; the
    ///   container is not touched.
    /// - [`AttachError::SignalProxy`] if proxying was requested and cannot
    ///   start.
    /// - [`AttachError::Invocation`] if starting or attaching fails.
    /// - [`AttachError::Report`] if the detached report cannot be written.
    pub async fn start_and_attach<C: Container>(
        &self,
        container: &Arc<C>,
        streams: AttachStreams,
        options: &AttachOptions,
        start: bool,
    ) -> Result<AttachReport, AttachError> {
        let id = container.id().clone();
        let background = streams.is_detached();
        let mut session = self.begin_terminal(container.has_tty())?;
        let resize = take_resize(session.as_mut());
        let proxy = self.start_proxy(container, options.sig_proxy).await?;

        tracing::debug!(id = %id, start, tty = session.is_some(), ?streams, "attaching to container");
        let outcome = match container.attach(streams, &options.detach_keys, resize, start).await {
            Ok(_) if background => Ok(AttachOutcome::Started),
            Ok(done) => match done.await {
                Ok(Ok(())) => Ok(AttachOutcome::Completed),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ContainerError::Io(std::io::Error::other(
                    "attach session ended without a result",
                ))),
            },
            Err(e) => Err(e),
        };

        let proxy = stop_proxy(proxy).await;
        let restored = end_terminal(session);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) if e.is_detached() => {
                tracing::info!(id = %id, "detached from container");
                AttachOutcome::Detached
            }
            Err(source) => {
                return Err(AttachError::Invocation {
                    operation: "attach",
                    id,
                    source,
                });
            }
        };
        restored?;

        if outcome == AttachOutcome::Started {
            self.report_id(&id)?;
        }
        Ok(AttachReport { id, outcome, proxy })
    }

    fn begin_terminal(&self, wants_tty: bool) -> Result<Option<TerminalSession<T>>, AttachError> {
        if !wants_tty || !self.terminal.is_terminal() {
            return Ok(None);
        }
        let session = TerminalSession::begin(Arc::clone(&self.terminal), self.signals.as_ref())?;
        Ok(Some(session))
    }

    async fn start_proxy<C: Container>(
        &self,
        container: &Arc<C>,
        enabled: bool,
    ) -> Result<Option<ProxySession>, AttachError> {
        if !enabled {
            return Ok(None);
        }
        let session = self.proxy.attach(Arc::clone(container)).await?;
        Ok(Some(session))
    }

    fn report_id(&self, id: &ContainerId) -> Result<(), AttachError> {
        let mut writer = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{id}")
            .and_then(|()| writer.flush())
            .map_err(AttachError::Report)
    }
}

impl<T: TerminalDevice> fmt::Debug for Attacher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attacher")
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

fn take_resize<T: TerminalDevice>(session: Option<&mut TerminalSession<T>>) -> Option<ResizeEvents> {
    session.and_then(TerminalSession::take_resize)
}

async fn stop_proxy(proxy: Option<ProxySession>) -> Option<ProxyExit> {
    match proxy {
        Some(session) => Some(session.stop().await),
        None => None,
    }
}

fn end_terminal<T: TerminalDevice>(session: Option<TerminalSession<T>>) -> Result<(), TerminalError> {
    let Some(mut session) = session else {
        return Ok(());
    };
    session.cancel_resize();
    session.restore()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(source: ContainerError) -> AttachError {
        AttachError::Invocation {
            operation: "exec",
            id: ContainerId::new("c1"),
            source,
        }
    }

    #[test]
    fn invocation_errors_map_to_command_exit_codes() {
        assert_eq!(invocation(ContainerError::Detached).exit_code(), 0);
        assert_eq!(
            invocation(ContainerError::PermissionDenied {
                message: "exec /bin/sh".into()
            })
            .exit_code(),
            126
        );
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(invocation(ContainerError::Io(denied)).exit_code(), 126);
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(invocation(ContainerError::Io(missing)).exit_code(), 127);
    }

    #[test]
    fn stopped_container_and_runtime_failures_cannot_invoke() {
        let stopped = ContainerError::InvalidState {
            id: ContainerId::new("c1"),
            reason: "container has exited".into(),
        };
        assert_eq!(invocation(stopped).exit_code(), 126);
        let broken = std::io::Error::other("broken pipe");
        assert_eq!(invocation(ContainerError::Io(broken)).exit_code(), 126);
        let runtime = ContainerError::Runtime(tether_common::error::TetherError::Config {
            message: "exec command is empty".into(),
        });
        assert_eq!(invocation(runtime).exit_code(), 126);
    }

    #[test]
    fn setup_errors_are_engine_failures() {
        let err = AttachError::Report(std::io::Error::other("closed"));
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn invocation_error_names_the_container() {
        let err = invocation(ContainerError::Io(std::io::Error::other("broken pipe")));
        assert_eq!(
            err.to_string(),
            "exec failed for container c1: container I/O failed: broken pipe"
        );
    }
}
