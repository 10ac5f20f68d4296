//! Detach key sequences.
//!
//! A detach sequence is written as a comma-separated list of keys, each
//! either a single character (`a`, `.`) or a control chord such as
//! `ctrl-p`. The default is `ctrl-p,ctrl-q`.

use std::fmt;
use std::str::FromStr;

use crate::error::TetherError;

/// Control chords in byte order: `ctrl-@` is 0x00, `ctrl-a` is 0x01, and
/// `ctrl-_` is 0x1f.
const CTRL_KEYS: [&str; 32] = [
    "ctrl-@", "ctrl-a", "ctrl-b", "ctrl-c", "ctrl-d", "ctrl-e", "ctrl-f", "ctrl-g", "ctrl-h",
    "ctrl-i", "ctrl-j", "ctrl-k", "ctrl-l", "ctrl-m", "ctrl-n", "ctrl-o", "ctrl-p", "ctrl-q",
    "ctrl-r", "ctrl-s", "ctrl-t", "ctrl-u", "ctrl-v", "ctrl-w", "ctrl-x", "ctrl-y", "ctrl-z",
    "ctrl-[", "ctrl-\\", "ctrl-]", "ctrl-^", "ctrl-_",
];

/// A parsed detach key sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetachKeys {
    spec: String,
    bytes: Vec<u8>,
}

impl DetachKeys {
    /// Parses a detach sequence. The empty string disables detaching.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] if any key is neither a single
    /// character nor a known control chord.
    pub fn parse(spec: &str) -> Result<Self, TetherError> {
        if spec.is_empty() {
            return Ok(Self::default());
        }
        let mut bytes = Vec::new();
        for key in spec.split(',') {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => bytes.push(c as u8),
                _ => {
                    let code = CTRL_KEYS
                        .iter()
                        .position(|ctrl| *ctrl == key)
                        .ok_or_else(|| TetherError::Config {
                            message: format!("invalid detach key {key:?} in {spec:?}"),
                        })?;
                    #[allow(clippy::cast_possible_truncation)]
                    bytes.push(code as u8);
                }
            }
        }
        Ok(Self {
            spec: spec.to_owned(),
            bytes,
        })
    }

    /// Returns the raw byte sequence.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl FromStr for DetachKeys {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DetachKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}
