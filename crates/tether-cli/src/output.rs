//! User-facing error reporting.

use std::error::Error;
use std::fmt::Write;

/// Renders an error and its sources as one line, `outer: inner: root`.
///
/// Sources already included in their parent's message are skipped.
#[must_use]
pub fn error_chain(err: &dyn Error) -> String {
    let mut line = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !line.contains(&text) {
            let _ = write!(line, ": {text}");
        }
        source = cause.source();
    }
    line
}

/// Prints `err` to standard error in the CLI's error format.
#[allow(clippy::print_stderr)]
pub fn report_error(err: &dyn Error) {
    eprintln!("Error: {}", error_chain(err));
}
