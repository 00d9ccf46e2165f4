//! Error categories and process exit codes.
//!
//! Every failure in the engine is classified into one of the categories
//! below, and the category number doubles as the process exit code.  The
//! numbering follows the convention long established by SCSI command-line
//! utilities, so scripts that already dispatch on those codes keep working.
//!
//! Low-level I/O keeps `std::io::Result`; once an operation has to give up,
//! it is wrapped into an [`Error`] carrying the category plus a one-line
//! message for stderr.

use std::fmt;
use std::io;

// ── Exit-status categories ────────────────────────────────────────────────────

/// Classified failure category; `as i32` is the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Bad or conflicting command-line operands.
    Syntax = 1,
    /// Device reports it is not ready.
    NotReady = 2,
    /// Device rejected the command as invalid or unsupported.
    InvalidOp = 5,
    /// Device reports a unit attention condition.
    UnitAttention = 6,
    /// Device aborted the command.
    AbortedCommand = 11,
    /// open/seek/lock/stat failure on a file-like endpoint.
    FileError = 15,
    /// Unrecovered medium error (possibly after exhausting coe_limit).
    MediumHard = 18,
    /// Protection-information check failed.
    Protection = 40,
    /// Protection-information check failed; failing LBA is known.
    ProtectionWithInfo = 41,
    /// Advisory whole-file lock could not be obtained.
    FlockErr = 90,
    /// Any other I/O failure.
    Other = 99,
}

impl Category {
    /// The process exit code for this category.
    #[inline]
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Syntax => "syntax error",
            Category::NotReady => "device not ready",
            Category::InvalidOp => "invalid operation",
            Category::UnitAttention => "unit attention",
            Category::AbortedCommand => "aborted command",
            Category::FileError => "file error",
            Category::MediumHard => "medium or hardware error",
            Category::Protection => "protection check failed",
            Category::ProtectionWithInfo => "protection check failed (info valid)",
            Category::FlockErr => "advisory lock unavailable",
            Category::Other => "I/O error",
        };
        f.write_str(name)
    }
}

// ── Error type ────────────────────────────────────────────────────────────────

/// A classified engine failure: category (= exit code) plus message.
#[derive(Debug)]
pub struct Error {
    pub category: Category,
    pub msg: String,
}

impl Error {
    pub fn new(category: Category, msg: impl Into<String>) -> Self {
        Error {
            category,
            msg: msg.into(),
        }
    }

    /// Convenience constructor for [`Category::Syntax`].
    pub fn syntax(msg: impl Into<String>) -> Self {
        Error::new(Category::Syntax, msg)
    }

    /// Convenience constructor for [`Category::FileError`].
    pub fn file(msg: impl Into<String>) -> Self {
        Error::new(Category::FileError, msg)
    }

    /// Convenience constructor for [`Category::Other`].
    pub fn other(msg: impl Into<String>) -> Self {
        Error::new(Category::Other, msg)
    }

    /// Convenience constructor for [`Category::MediumHard`].
    pub fn medium(msg: impl Into<String>) -> Self {
        Error::new(Category::MediumHard, msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.category)
        } else {
            write!(f, "{}", self.msg)
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(Category::Other, e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::new(Category::Other, e.to_string())
    }
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_category_numbers() {
        assert_eq!(Category::Syntax.exit_code(), 1);
        assert_eq!(Category::NotReady.exit_code(), 2);
        assert_eq!(Category::InvalidOp.exit_code(), 5);
        assert_eq!(Category::UnitAttention.exit_code(), 6);
        assert_eq!(Category::AbortedCommand.exit_code(), 11);
        assert_eq!(Category::FileError.exit_code(), 15);
        assert_eq!(Category::MediumHard.exit_code(), 18);
        assert_eq!(Category::FlockErr.exit_code(), 90);
        assert_eq!(Category::Other.exit_code(), 99);
    }

    #[test]
    fn display_uses_message_when_present() {
        let e = Error::file("of: cannot open");
        assert_eq!(e.to_string(), "of: cannot open");
        let bare = Error::new(Category::MediumHard, "");
        assert_eq!(bare.to_string(), "medium or hardware error");
    }

    #[test]
    fn io_error_maps_to_cat_other() {
        let e: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(e.category, Category::Other);
    }
}
