//! The shared error taxonomy.
//!
//! Every fallible kernel operation returns a signed machine word: zero or
//! positive on success, a negative code from this taxonomy on failure. The
//! same codes are used crate-wide so a loader failure, a lock failure and a
//! gate failure all speak the same language.

use core::fmt;

/// Positive error codes; the gate carries them negated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    OutOfMemory = 1,
    InvalidParameter = 2,
    InvalidHandle = 3,
    NotFound = 4,
    PermissionDenied = 5,
    /// Resource in use; returned by try-lock operations.
    Busy = 6,
    /// Reentrant acquisition by the owning thread.
    Deadlock = 7,
    TimedOut = 8,
    /// A signal arrived while waiting.
    Interrupted = 9,
    /// The wait value no longer matched.
    WouldBlock = 10,
    EndOfFile = 11,
    BufferTooSmall = 12,
    NotADirectory = 13,
    UnexpectedType = 14,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    /// Encode for the gate return word.
    pub const fn to_word(self) -> isize {
        -(self as i32 as isize)
    }

    /// Decode a negative gate return word.
    pub fn from_word(word: isize) -> Option<Self> {
        use self::Error::*;
        Some(match -word {
            1 => OutOfMemory,
            2 => InvalidParameter,
            3 => InvalidHandle,
            4 => NotFound,
            5 => PermissionDenied,
            6 => Busy,
            7 => Deadlock,
            8 => TimedOut,
            9 => Interrupted,
            10 => WouldBlock,
            11 => EndOfFile,
            12 => BufferTooSmall,
            13 => NotADirectory,
            14 => UnexpectedType,
            _ => return None,
        })
    }

    /// Split a signed gate return into success value or error.
    pub fn demux(word: isize) -> Result<usize> {
        if word >= 0 {
            Ok(word as usize)
        } else {
            Err(Self::from_word(word).unwrap_or(Error::InvalidParameter))
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Error::OutOfMemory => "out of memory",
            Error::InvalidParameter => "invalid parameter",
            Error::InvalidHandle => "invalid handle",
            Error::NotFound => "not found",
            Error::PermissionDenied => "permission denied",
            Error::Busy => "resource in use",
            Error::Deadlock => "deadlock avoided",
            Error::TimedOut => "timed out",
            Error::Interrupted => "interrupted by signal",
            Error::WouldBlock => "wait value mismatch",
            Error::EndOfFile => "end of file",
            Error::BufferTooSmall => "buffer too small",
            Error::NotADirectory => "not a directory",
            Error::UnexpectedType => "unexpected type",
        };
        write!(f, "{}", desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trip() {
        for err in [
            Error::OutOfMemory,
            Error::Deadlock,
            Error::TimedOut,
            Error::UnexpectedType,
        ] {
            let word = err.to_word();
            assert!(word < 0);
            assert_eq!(Error::from_word(word), Some(err));
            assert_eq!(Error::demux(word), Err(err));
        }
    }

    #[test]
    fn demux_success() {
        assert_eq!(Error::demux(0), Ok(0));
        assert_eq!(Error::demux(4096), Ok(4096));
    }

    #[test]
    fn unknown_code_maps_to_invalid() {
        assert_eq!(Error::demux(-998), Err(Error::InvalidParameter));
    }
}
