//! The bundle of stream endpoints an attach session multiplexes.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

/// Readable endpoint forwarded to the container's standard input.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable endpoint receiving the container's output.
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Input, output and error endpoints for one attach session.
///
/// The `attach_*` flags are derived from which endpoints are present, so
/// a missing stream is never reported as attached.
#[derive(Default)]
pub struct AttachStreams {
    input: Option<InputStream>,
    output: Option<OutputStream>,
    error: Option<OutputStream>,
}

impl AttachStreams {
    /// Bundles the given endpoints.
    #[must_use]
    pub fn new(
        input: Option<InputStream>,
        output: Option<OutputStream>,
        error: Option<OutputStream>,
    ) -> Self {
        Self {
            input,
            output,
            error,
        }
    }

    /// Bundles the process's own standard streams.
    ///
    /// Standard input is left out when `interactive` is false.
    #[must_use]
    pub fn stdio(interactive: bool) -> Self {
        let input: Option<InputStream> = if interactive {
            Some(Box::new(tokio::io::stdin()))
        } else {
            None
        };
        Self::new(
            input,
            Some(Box::new(tokio::io::stdout())),
            Some(Box::new(tokio::io::stderr())),
        )
    }

    /// Whether standard input is forwarded.
    #[must_use]
    pub const fn attach_input(&self) -> bool {
        self.input.is_some()
    }

    /// Whether standard output is forwarded.
    #[must_use]
    pub const fn attach_output(&self) -> bool {
        self.output.is_some()
    }

    /// Whether standard error is forwarded.
    #[must_use]
    pub const fn attach_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether neither output nor error is forwarded: the session runs
    /// detached and only the container ID is reported.
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.output.is_none() && self.error.is_none()
    }

    /// Splits the bundle into its endpoints.
    #[must_use]
    pub fn into_parts(self) -> (Option<InputStream>, Option<OutputStream>, Option<OutputStream>) {
        (self.input, self.output, self.error)
    }
}

impl fmt::Debug for AttachStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachStreams")
            .field("attach_input", &self.attach_input())
            .field("attach_output", &self.attach_output())
            .field("attach_error", &self.attach_error())
            .finish()
    }
}
