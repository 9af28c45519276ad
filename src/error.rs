use std::borrow::Cow;
use std::cell::Cell;
use std::fmt;
use std::io;
use thiserror::Error;

/// Why a checkpoint did not produce an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A callback asked to retry later.
    TempFailure,
    /// A callback vetoed the checkpoint.
    PermFailure,
    /// This process excluded itself from the checkpoint.
    Omitted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AbortReason::TempFailure => "temporary failure",
            AbortReason::PermFailure => "permanent failure",
            AbortReason::Omitted => "omitted",
        })
    }
}

#[derive(Error, Debug)]
pub enum CrestError {
    #[error("checkpoint client is not initialized")]
    NotInitialized,

    #[error("checkpoint support could not be initialized: {0}")]
    NotInitializable(String),

    #[error("operation is only valid inside a checkpoint callback")]
    NotInCallback,

    #[error("a checkpoint request is already outstanding")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    #[error("checkpoint poll failed: {0}")]
    PollFailed(#[source] io::Error),

    #[error("checkpoint aborted: {0}")]
    Aborted(AbortReason),

    #[error("callback table is full ({0} entries)")]
    NoSpace(usize),

    #[error("checkpoint client faulted: {0}")]
    Faulted(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("invalid configuration {key}={value}")]
    Config { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, CrestError>;

/// Stable numeric codes, placed above the errno range so the two never
/// collide in [`error_to_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    NotInitialized = 512,
    NotInitializable,
    NotInCallback,
    Busy,
    InvalidArgument,
    OutOfRange,
    PollFailed,
    Aborted,
    NoSpace,
    Faulted,
    Io,
    InvalidImage,
    Config,
}

const FIRST_CODE: i32 = ErrorCode::NotInitialized as i32;
const LAST_CODE: i32 = ErrorCode::Config as i32;

impl ErrorCode {
    pub fn from_raw(code: i32) -> Option<Self> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 13] = [
            NotInitialized,
            NotInitializable,
            NotInCallback,
            Busy,
            InvalidArgument,
            OutOfRange,
            PollFailed,
            Aborted,
            NoSpace,
            Faulted,
            Io,
            InvalidImage,
            Config,
        ];
        if (FIRST_CODE..=LAST_CODE).contains(&code) {
            Some(ALL[(code - FIRST_CODE) as usize])
        } else {
            None
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotInitialized => "Checkpoint client is not initialized",
            ErrorCode::NotInitializable => "Checkpoint support is unavailable in this process",
            ErrorCode::NotInCallback => "Operation is only valid inside a checkpoint callback",
            ErrorCode::Busy => "A checkpoint request is already outstanding",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::OutOfRange => "Counter out of range",
            ErrorCode::PollFailed => "Checkpoint poll failed",
            ErrorCode::Aborted => "Checkpoint aborted by a callback",
            ErrorCode::NoSpace => "Callback table is full",
            ErrorCode::Faulted => "Checkpoint client hit an unrecoverable fault",
            ErrorCode::Io => "I/O error",
            ErrorCode::InvalidImage => "Invalid snapshot image",
            ErrorCode::Config => "Invalid configuration value",
        }
    }
}

impl CrestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CrestError::NotInitialized => ErrorCode::NotInitialized,
            CrestError::NotInitializable(_) => ErrorCode::NotInitializable,
            CrestError::NotInCallback => ErrorCode::NotInCallback,
            CrestError::Busy => ErrorCode::Busy,
            CrestError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CrestError::OutOfRange(_) => ErrorCode::OutOfRange,
            CrestError::PollFailed(_) => ErrorCode::PollFailed,
            CrestError::Aborted(_) => ErrorCode::Aborted,
            CrestError::NoSpace(_) => ErrorCode::NoSpace,
            CrestError::Faulted(_) => ErrorCode::Faulted,
            CrestError::Io(_) => ErrorCode::Io,
            CrestError::ProtobufDecode(_) | CrestError::InvalidImage { .. } => {
                ErrorCode::InvalidImage
            }
            CrestError::Config { .. } => ErrorCode::Config,
        }
    }

    /// Short static detail for the thread-local error slot.
    pub fn reason(&self) -> &'static str {
        match self {
            CrestError::InvalidArgument(r) | CrestError::OutOfRange(r) | CrestError::Faulted(r) => r,
            CrestError::Aborted(AbortReason::TempFailure) => "temporary failure",
            CrestError::Aborted(AbortReason::PermFailure) => "permanent failure",
            CrestError::Aborted(AbortReason::Omitted) => "omitted",
            other => other.code().description(),
        }
    }
}

/// Human-readable text for a crest error code or an errno value.
pub fn error_to_string(code: i32) -> Cow<'static, str> {
    match ErrorCode::from_raw(code) {
        Some(c) => Cow::Borrowed(c.description()),
        None => Cow::Owned(io::Error::from_raw_os_error(code).to_string()),
    }
}

thread_local! {
    static LAST_ERROR: Cell<Option<(ErrorCode, &'static str)>> = const { Cell::new(None) };
}

/// Code and detail of the last error reported to this thread.
pub fn last_error() -> Option<(ErrorCode, &'static str)> {
    LAST_ERROR.with(|c| c.get())
}

pub(crate) fn record(e: &CrestError) {
    LAST_ERROR.with(|c| c.set(Some((e.code(), e.reason()))));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_from_raw() {
        assert_eq!(ErrorCode::from_raw(512), Some(ErrorCode::NotInitialized));
        assert_eq!(ErrorCode::from_raw(LAST_CODE), Some(ErrorCode::Config));
        assert_eq!(ErrorCode::from_raw(LAST_CODE + 1), None);
        assert_eq!(ErrorCode::from_raw(libc::EINVAL), None);
    }

    #[test]
    fn test_error_to_string_falls_back_to_strerror() {
        assert_eq!(
            error_to_string(ErrorCode::Busy as i32),
            "A checkpoint request is already outstanding"
        );
        let text = error_to_string(libc::ENOENT);
        assert!(text.contains("No such file"), "{}", text);
    }

    #[test]
    fn test_record_sets_thread_local_reason() {
        record(&CrestError::OutOfRange("persist counter underflow"));
        assert_eq!(
            last_error(),
            Some((ErrorCode::OutOfRange, "persist counter underflow"))
        );
        let other = std::thread::spawn(last_error).join().unwrap();
        assert_eq!(other, None);
    }
}
