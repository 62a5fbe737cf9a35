use std::{num::ParseIntError, string::FromUtf8Error};

use crate::messages::{Notice, ResponseMessage};

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    // Errors from external libraries
    Io(std::io::Error),
    ParseInt(ParseIntError),
    FromUtf8(FromUtf8Error),
    ParseTime(time::error::Parse),
    Format(time::error::Format),
    Arrow(arrow::error::ArrowError),
    Parquet(parquet::errors::ParquetError),
    Poison(String),

    // Errors raised by this crate
    Parse(usize, String, String),
    ServerVersion(i32, i32, String),
    Simple(String),
    InvalidArgument(String),
    ConnectionFailed,
    ConnectionReset,
    Shutdown,
    Cancelled,
    Message(i32, String),
    UnexpectedResponse(ResponseMessage),
    UnexpectedEndOfStream,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(ref err) => err.fmt(f),
            Error::ParseInt(ref err) => err.fmt(f),
            Error::FromUtf8(ref err) => err.fmt(f),
            Error::ParseTime(ref err) => err.fmt(f),
            Error::Format(ref err) => err.fmt(f),
            Error::Arrow(ref err) => err.fmt(f),
            Error::Parquet(ref err) => err.fmt(f),
            Error::Poison(ref err) => write!(f, "{err}"),

            Error::Parse(i, value, message) => write!(f, "parse error: {i} - {value} - {message}"),
            Error::ServerVersion(wanted, have, message) => write!(f, "server version {wanted} required, got {have}: {message}"),
            Error::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Error::ConnectionFailed => write!(f, "ConnectionFailed"),
            Error::ConnectionReset => write!(f, "ConnectionReset"),
            Error::Shutdown => write!(f, "Shutdown"),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::Message(code, message) => write!(f, "[{code}] {message}"),
            Error::UnexpectedResponse(message) => write!(f, "unexpected response: {message:?}"),
            Error::UnexpectedEndOfStream => write!(f, "unexpected end of stream"),

            Error::Simple(ref err) => write!(f, "error occurred: {err}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Error {
        Error::ParseInt(err)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Error {
        Error::FromUtf8(err)
    }
}

impl From<time::error::Parse> for Error {
    fn from(err: time::error::Parse) -> Error {
        Error::ParseTime(err)
    }
}

impl From<time::error::Format> for Error {
    fn from(err: time::error::Format) -> Error {
        Error::Format(err)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Error {
        Error::Arrow(err)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Error {
        Error::Parquet(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Error {
        Error::Poison(format!("Mutex poison error: {err}"))
    }
}

impl From<Notice> for Error {
    fn from(notice: Notice) -> Error {
        Error::Message(notice.code, notice.message)
    }
}

impl From<ResponseMessage> for Error {
    fn from(message: ResponseMessage) -> Error {
        Error::from(Notice::from(&message))
    }
}

/// Returns `true` for I/O failures that indicate the gateway socket was lost.
pub(crate) fn is_connection_error(error: &Error) -> bool {
    match error {
        Error::Io(err) => matches!(
            err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

/// Returns `true` when a socket read gave up because of the read timeout.
pub(crate) fn is_timeout_error(error: &Error) -> bool {
    match error {
        Error::Io(err) => matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn test_connection_errors() {
        assert!(is_connection_error(&Error::Io(std::io::Error::new(ErrorKind::ConnectionReset, "reset"))));
        assert!(is_connection_error(&Error::Io(std::io::Error::new(ErrorKind::UnexpectedEof, "eof"))));
        assert!(!is_connection_error(&Error::Io(std::io::Error::new(ErrorKind::WouldBlock, "would block"))));
        assert!(!is_connection_error(&Error::Shutdown));
    }

    #[test]
    fn test_timeout_errors() {
        assert!(is_timeout_error(&Error::Io(std::io::Error::new(ErrorKind::WouldBlock, "would block"))));
        assert!(is_timeout_error(&Error::Io(std::io::Error::new(ErrorKind::TimedOut, "timed out"))));
        assert!(!is_timeout_error(&Error::ConnectionReset));
    }

    #[test]
    fn test_error_from_response_message() {
        let message = ResponseMessage::from_simple("4|2|9000|162|Historical Market Data Service error message:HMDS query returned no data|");

        match Error::from(message) {
            Error::Message(code, text) => {
                assert_eq!(code, 162);
                assert_eq!(text, "Historical Market Data Service error message:HMDS query returned no data");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
