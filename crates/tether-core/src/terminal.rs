//! Local terminal control.
//!
//! [`TerminalDevice`] is the narrow interface the attach runtime needs from
//! the controlling terminal. [`HostTerminal`] implements it for the
//! process's standard input using termios.

use std::sync::atomic::{AtomicBool, Ordering};

use tether_common::error::Result;
use tether_common::types::TerminalSize;

static RAW_MODE: AtomicBool = AtomicBool::new(false);

/// Returns whether the host terminal is currently in raw mode.
///
/// Log writers use this to emit `\r\n` line endings while output
/// post-processing is disabled.
pub fn raw_mode_active() -> bool {
    RAW_MODE.load(Ordering::Relaxed)
}

/// A terminal whose mode and geometry can be controlled.
pub trait TerminalDevice: Send + Sync + 'static {
    /// Opaque snapshot of the terminal mode.
    type State: Send + 'static;

    /// Returns whether the device is an interactive terminal.
    fn is_terminal(&self) -> bool;

    /// Reads the current geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be queried.
    fn size(&self) -> Result<TerminalSize>;

    /// Captures the current mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode cannot be read.
    fn save_state(&self) -> Result<Self::State>;

    /// Switches the terminal to raw mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode cannot be changed.
    fn set_raw(&self) -> Result<()>;

    /// Restores a previously captured mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode cannot be applied.
    fn restore(&self, state: &Self::State) -> Result<()>;
}

/// The terminal attached to this process's standard input.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTerminal;

impl HostTerminal {
    /// Creates a handle on the host terminal.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
impl TerminalDevice for HostTerminal {
    type State = nix::sys::termios::Termios;

    fn is_terminal(&self) -> bool {
        use std::io::IsTerminal;

        std::io::stdin().is_terminal()
    }

    fn size(&self) -> Result<TerminalSize> {
        let (cols, rows) =
            crossterm::terminal::size().map_err(|e| tether_common::error::TetherError::Os {
                facility: "terminal size query",
                source: e,
            })?;
        Ok(TerminalSize::new(rows, cols))
    }

    fn save_state(&self) -> Result<Self::State> {
        nix::sys::termios::tcgetattr(std::io::stdin()).map_err(|e| os_error("terminal state save", e))
    }

    fn set_raw(&self) -> Result<()> {
        use nix::sys::termios::{SetArg, cfmakeraw, tcgetattr, tcsetattr};

        let mut termios = tcgetattr(std::io::stdin()).map_err(|e| os_error("terminal raw mode", e))?;
        cfmakeraw(&mut termios);
        tcsetattr(std::io::stdin(), SetArg::TCSANOW, &termios)
            .map_err(|e| os_error("terminal raw mode", e))?;
        RAW_MODE.store(true, Ordering::Relaxed);
        tracing::debug!("terminal switched to raw mode");
        Ok(())
    }

    fn restore(&self, state: &Self::State) -> Result<()> {
        use nix::sys::termios::{SetArg, tcsetattr};

        tcsetattr(std::io::stdin(), SetArg::TCSANOW, state)
            .map_err(|e| os_error("terminal state restore", e))?;
        RAW_MODE.store(false, Ordering::Relaxed);
        tracing::debug!("terminal state restored");
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn os_error(facility: &'static str, errno: nix::errno::Errno) -> tether_common::error::TetherError {
    tether_common::error::TetherError::Os {
        facility,
        source: std::io::Error::from(errno),
    }
}

/// Terminal control is unavailable on this platform.
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
impl TerminalDevice for HostTerminal {
    type State = ();

    fn is_terminal(&self) -> bool {
        false
    }

    fn size(&self) -> Result<TerminalSize> {
        Err(tether_common::error::TetherError::unsupported("terminal size query"))
    }

    fn save_state(&self) -> Result<Self::State> {
        Err(tether_common::error::TetherError::unsupported("terminal state save"))
    }

    fn set_raw(&self) -> Result<()> {
        Err(tether_common::error::TetherError::unsupported("terminal raw mode"))
    }

    fn restore(&self, _state: &Self::State) -> Result<()> {
        Err(tether_common::error::TetherError::unsupported("terminal state restore"))
    }
}
