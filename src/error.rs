/// Error taxonomy, parse-error accumulation, and `CallReturnValue`.
///
/// Runtime errors are non-unwinding: the VM prints them, bumps a counter,
/// and keeps going. Everything a VM-visible call can do, including the
/// cooperative-scheduling transitions, is expressed through
/// `CallReturnValue`.

use crate::time::Duration;
use std::fmt;
use thiserror::Error as ThisError;

/// Error codes. Filesystem codes are surfaced verbatim from a host FS
/// implementation; the core itself only raises the parse/runtime/resource
/// and API kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("parse error")]
    Parse,
    #[error("runtime error")]
    Runtime,

    // Filesystem, surfaced from the host FS
    #[error("file exists")]
    FileExists,
    #[error("file not found")]
    FileNotFound,
    #[error("file closed")]
    FileClosed,
    #[error("not readable")]
    NotReadable,
    #[error("not writable")]
    NotWritable,
    #[error("seek not allowed")]
    SeekNotAllowed,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("directory not found")]
    DirectoryNotFound,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("not a directory")]
    NotADirectory,
    #[error("not a file")]
    NotAFile,
    #[error("invalid file name")]
    InvalidFileName,
    #[error("format failed")]
    FormatFailed,
    #[error("filesystem not formatted")]
    FSNotFormatted,
    #[error("no filesystem")]
    NoFS,
    #[error("no space")]
    NoSpace,
    #[error("mount failed")]
    MountFailed,
    #[error("not mounted")]
    NotMounted,
    #[error("already mounted")]
    Mounted,
    #[error("filesystem corrupted")]
    Corrupted,

    // Resource
    #[error("out of memory")]
    OutOfMemory,
    #[error("param out of range")]
    OutOfRange,
    #[error("unimplemented function")]
    Unimplemented,
    #[error("internal error")]
    InternalError,

    // API, raised by native function preludes
    #[error("wrong number of parameters")]
    WrongNumberOfParams,
    #[error("property does not exist")]
    PropertyDoesNotExist,
    #[error("invalid argument value")]
    InvalidArgumentValue,
    #[error("missing this value")]
    MissingThis,
    #[error("cannot call value of this type")]
    CannotCall,
    #[error("cannot construct value of this type")]
    CannotConstruct,
    #[error("string cannot be converted")]
    CannotConvertStringToNumber,
}

impl Error {
    fn kind(self) -> &'static str {
        match self {
            Error::Parse => "Parse",
            Error::Runtime => "Runtime",
            Error::FileExists
            | Error::FileNotFound
            | Error::FileClosed
            | Error::NotReadable
            | Error::NotWritable
            | Error::SeekNotAllowed
            | Error::TooManyOpenFiles
            | Error::DirectoryNotFound
            | Error::DirectoryNotEmpty
            | Error::NotADirectory
            | Error::NotAFile
            | Error::InvalidFileName
            | Error::FormatFailed
            | Error::FSNotFormatted
            | Error::NoFS
            | Error::NoSpace
            | Error::MountFailed
            | Error::NotMounted
            | Error::Mounted
            | Error::Corrupted => "Filesystem",
            Error::OutOfMemory
            | Error::OutOfRange
            | Error::Unimplemented
            | Error::InternalError => "Resource",
            _ => "API",
        }
    }

    /// `"<Kind> Error: <message> on line <n>\n"`, the one format every
    /// diagnostic the VM prints goes through.
    pub fn format(self, lineno: u32, message: &str) -> String {
        let mut s = format!("{} Error", self.kind());
        if !message.is_empty() {
            s.push_str(": ");
            s.push_str(message);
        }
        if lineno != 0 {
            s.push_str(&format!(" on line {}", lineno));
        }
        s.push('\n');
        s
    }
}

/// One accumulated syntax error.
#[derive(Debug, Clone)]
pub struct ParseErrorEntry {
    pub description: String,
    pub lineno: u32,
    pub charno: u16,
    pub length: u16,
}

impl ParseErrorEntry {
    pub fn new(description: &str, lineno: u32, charno: u16, length: u16) -> ParseErrorEntry {
        ParseErrorEntry {
            description: description.to_string(),
            lineno,
            charno,
            length,
        }
    }
}

impl fmt::Display for ParseErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error: {} on line {}", self.description, self.lineno)
    }
}

pub type ParseErrorList = Vec<ParseErrorEntry>;

/// Result of every VM-visible call. Encodes ordinary returns and the
/// cooperative-scheduling transitions in one sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallReturnValue {
    /// Normal return leaving `n` values on the runtime stack.
    ReturnCount(u32),
    /// Suspend the task for at least the given span.
    Delay(Duration),
    /// A script function was entered; the dispatcher must re-enter.
    FunctionStart,
    /// Top-level program ran to completion.
    Finished,
    /// Task was terminated (request or fatal error budget).
    Terminated,
    /// Suspend until an event is queued.
    WaitForEvent,
    /// Time slice expired or an event arrived; task stays ready.
    Yield,
    Error(Error),
}

impl CallReturnValue {
    pub fn is_return_count(self) -> bool {
        matches!(self, CallReturnValue::ReturnCount(_))
    }

    pub fn return_count(self) -> u32 {
        match self {
            CallReturnValue::ReturnCount(n) => n,
            _ => 0,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, CallReturnValue::Error(_))
    }

    pub fn is_finished(self) -> bool {
        matches!(self, CallReturnValue::Finished)
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, CallReturnValue::Terminated)
    }

    pub fn is_yield(self) -> bool {
        matches!(self, CallReturnValue::Yield)
    }

    pub fn is_delay(self) -> bool {
        matches!(self, CallReturnValue::Delay(_))
    }

    pub fn is_wait_for_event(self) -> bool {
        matches!(self, CallReturnValue::WaitForEvent)
    }

    pub fn is_function_start(self) -> bool {
        matches!(self, CallReturnValue::FunctionStart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_format_matches_contract() {
        let s = Error::Runtime.format(12, "Property 'foo' does not exist");
        assert_eq!(s, "Runtime Error: Property 'foo' does not exist on line 12\n");
    }

    #[test]
    fn call_return_value_predicates() {
        assert!(CallReturnValue::ReturnCount(2).is_return_count());
        assert_eq!(CallReturnValue::ReturnCount(2).return_count(), 2);
        assert!(CallReturnValue::Error(Error::CannotCall).is_error());
        assert!(CallReturnValue::Delay(Duration::from_ms(5)).is_delay());
    }
}
