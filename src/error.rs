//! The error type shared across the crate, plus the sink that accumulates
//! non-fatal link errors between pass checkpoints.

use core::fmt;
use core::result;
use std::error;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub enum Error {
    /// The leading magic does not match any input kind we can read
    BadMagic(u64),
    /// An input is structurally invalid; the message carries file and offset
    Malformed(String),
    /// One or more semantic errors were reported; diagnostics already
    /// went to stderr and the link cannot continue
    LinkFailed,
    /// An underlying read or write failed
    IO(io::Error),
    /// A structured read or write fell off the end of a buffer
    Scroll(scroll::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(io) => Some(io),
            Error::Scroll(scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadMagic(magic) => write!(fmt, "invalid magic number: {:#x}", magic),
            Error::Malformed(msg) => write!(fmt, "malformed entity: {}", msg),
            Error::LinkFailed => write!(fmt, "link failed"),
            Error::IO(err) => write!(fmt, "{}", err),
            Error::Scroll(err) => write!(fmt, "{}", err),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Collects semantic errors (undefined symbols, duplicate definitions,
/// unusable relocations) raised from any thread. Errors never unwind out
/// of a parallel task; they are logged here and surfaced at the next
/// [`Diags::checkpoint`].
#[derive(Debug, Default)]
pub struct Diags {
    has_error: AtomicBool,
}

impl Diags {
    pub fn new() -> Diags {
        Diags::default()
    }

    /// Reports a semantic error and latches the failure flag.
    /// Diagnostics are formatted as `<file>[:<offset>]: error: <message>`
    /// by the call sites.
    pub fn error(&self, msg: impl fmt::Display) {
        log::error!("{}", msg);
        self.has_error.store(true, Ordering::Relaxed);
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        log::warn!("{}", msg);
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }

    /// Aborts the link if any error was logged since the last checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        if self.has_error() {
            Err(Error::LinkFailed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_latches() {
        let diags = Diags::new();
        assert!(diags.checkpoint().is_ok());
        diags.error("boom");
        assert!(matches!(diags.checkpoint(), Err(Error::LinkFailed)));
        // the flag stays latched
        assert!(diags.checkpoint().is_err());
    }
}
