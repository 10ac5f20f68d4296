//! Diagnostic log setup.
//!
//! Logs go to standard error, filtered by `RUST_LOG` (default `warn`).
//! While the terminal is in raw mode the output post-processing that turns
//! `\n` into `\r\n` is off, so the writer does the translation itself.

use std::io::{self, Write};

use tether_core::terminal::raw_mode_active;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Installs the global subscriber.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RawAwareStderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Makes writers for [`RawAwareStderr`].
#[derive(Debug, Clone, Copy)]
struct RawAwareStderr;

impl<'a> MakeWriter<'a> for RawAwareStderr {
    type Writer = RawAwareWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RawAwareWriter {
            inner: io::stderr(),
        }
    }
}

/// Standard error, with `\r\n` line endings while in raw mode.
struct RawAwareWriter {
    inner: io::Stderr,
}

impl Write for RawAwareWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !raw_mode_active() {
            return self.inner.write(buf);
        }
        self.inner.write_all(&crlf(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Expands every `\n` not already preceded by `\r` into `\r\n`.
fn crlf(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + buf.len() / 16 + 1);
    let mut previous = 0_u8;
    for &byte in buf {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}
