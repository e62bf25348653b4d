use alloc::string::String;

/// Everything that can go wrong while decoding frame information or
/// evaluating a location.
///
/// The first three variants are "soft": they describe a value that the
/// debugger cannot show, not broken input. Use [`Error::marker`] to turn them
/// into what a user should see.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Required registers or memory could not be read from the target.
    #[error("value is not available: {0}")]
    Unavailable(String),
    /// The value does not exist at this point of the program.
    #[error("value has been optimized out")]
    OptimizedOut,
    /// An entry value could not be determined from the call site information.
    #[error("no entry value: {0}")]
    NoEntryValue(String),
    #[error("unexpected end of data at offset {offset:#x}: wanted {wanted} bytes, {available} available")]
    UnexpectedEof {
        offset: usize,
        wanted: usize,
        available: usize,
    },
    /// The dwarf is invalid.
    #[error("corrupt DWARF: {0}")]
    Corrupt(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unable to access DWARF register number {0}")]
    BadRegister(u64),
    #[error("access outside bounds of object referenced via synthetic pointer")]
    InvalidSyntheticPointer,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unavailable,
    OptimizedOut,
    NoEntryValue,
    Corrupt,
    Unsupported,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::OptimizedOut => ErrorKind::OptimizedOut,
            Error::NoEntryValue(_) => ErrorKind::NoEntryValue,
            Error::UnexpectedEof { .. }
            | Error::Corrupt(_)
            | Error::BadRegister(_)
            | Error::InvalidSyntheticPointer => ErrorKind::Corrupt,
            Error::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// The marker shown in place of a value that failed softly. Hard errors
    /// return `None` and should be reported as errors.
    pub fn marker(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::Unavailable => Some("<unavailable>"),
            ErrorKind::OptimizedOut | ErrorKind::NoEntryValue => Some("<optimized out>"),
            ErrorKind::Corrupt | ErrorKind::Unsupported => None,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub(crate) fn no_entry_value(msg: impl Into<String>) -> Self {
        Error::NoEntryValue(msg.into())
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
