use std::fmt::Display;

/// Firkin errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An IO error. The operation failed; the store remains usable.
    Io(String),
    /// A record fetched through the index failed its CRC check.
    Corrupt(String),
    /// A record was cut short. Tolerated at the tail of a file during
    /// recovery scans, fatal on an indexed read.
    Truncated(String),
    /// Invalid user input, typically a key or value outside its size bounds.
    InvalidInput(String),
    /// The store was closed or destroyed.
    Closed,
    /// An internal invariant was violated. Indicates a bug.
    InvalidState(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
            Error::Truncated(msg) => write!(f, "truncated record: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Closed => write!(f, "store is closed"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// A Firkin Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
