use std::{error::Error, fmt};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, trace};

use crate::metadata::{MetadataMap, GRPC_TIMEOUT_HEADER};

/// The `grpc-status` trailer carrying the canonical status code.
pub(crate) const GRPC_STATUS_HEADER: &str = "grpc-status";
/// The `grpc-message` trailer carrying the (percent-encoded) status message.
pub(crate) const GRPC_MESSAGE_HEADER: &str = "grpc-message";
/// The `grpc-status-details-bin` trailer carrying opaque status details.
pub(crate) const GRPC_STATUS_DETAILS_HEADER: &str = "grpc-status-details-bin";

/// Bytes that must be percent-encoded inside `grpc-message`.
///
/// Everything outside the printable ASCII range is escaped, plus `%` itself.
const GRPC_MESSAGE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// A result of an RPC, as carried in the `grpc-status` family of trailers.
///
/// A `Status` is immutable once constructed. An OK status never carries a
/// message or details.
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: String,
    /// Opaque details transported via `grpc-status-details-bin`.
    details: Bytes,
    /// Trailer metadata observed alongside the status.
    metadata: MetadataMap,
}

/// Canonical RPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the specified operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Get the description of this `Code`.
    pub fn description(&self) -> &'static str {
        match self {
            Code::Ok => "The operation completed successfully",
            Code::Cancelled => "The operation was cancelled",
            Code::Unknown => "Unknown error",
            Code::InvalidArgument => "Client specified an invalid argument",
            Code::DeadlineExceeded => "Deadline expired before operation could complete",
            Code::NotFound => "Some requested entity was not found",
            Code::AlreadyExists => "Some entity that we attempted to create already exists",
            Code::PermissionDenied => {
                "The caller does not have permission to execute the specified operation"
            }
            Code::ResourceExhausted => "Some resource has been exhausted",
            Code::FailedPrecondition => {
                "The system is not in a state required for the operation's execution"
            }
            Code::Aborted => "The operation was aborted",
            Code::OutOfRange => "Operation was attempted past the valid range",
            Code::Unimplemented => "Operation is not implemented or not supported",
            Code::Internal => "Internal error",
            Code::Unavailable => "The service is currently unavailable",
            Code::DataLoss => "Unrecoverable data loss or corruption",
            Code::Unauthenticated => "The request does not have valid authentication credentials",
        }
    }

    /// Converts an integer value into its canonical `Code`. Values outside
    /// the canonical range map to `Unknown`.
    pub fn from_i32(i: i32) -> Code {
        match i {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Code {
        match bytes.len() {
            1 => match bytes[0] {
                b'0' => Code::Ok,
                b'1' => Code::Cancelled,
                b'2' => Code::Unknown,
                b'3' => Code::InvalidArgument,
                b'4' => Code::DeadlineExceeded,
                b'5' => Code::NotFound,
                b'6' => Code::AlreadyExists,
                b'7' => Code::PermissionDenied,
                b'8' => Code::ResourceExhausted,
                b'9' => Code::FailedPrecondition,
                _ => Code::parse_err(),
            },
            2 => match (bytes[0], bytes[1]) {
                (b'1', b'0') => Code::Aborted,
                (b'1', b'1') => Code::OutOfRange,
                (b'1', b'2') => Code::Unimplemented,
                (b'1', b'3') => Code::Internal,
                (b'1', b'4') => Code::Unavailable,
                (b'1', b'5') => Code::DataLoss,
                (b'1', b'6') => Code::Unauthenticated,
                _ => Code::parse_err(),
            },
            _ => Code::parse_err(),
        }
    }

    pub(crate) fn to_header_value(self) -> HeaderValue {
        match self {
            Code::Ok => HeaderValue::from_static("0"),
            Code::Cancelled => HeaderValue::from_static("1"),
            Code::Unknown => HeaderValue::from_static("2"),
            Code::InvalidArgument => HeaderValue::from_static("3"),
            Code::DeadlineExceeded => HeaderValue::from_static("4"),
            Code::NotFound => HeaderValue::from_static("5"),
            Code::AlreadyExists => HeaderValue::from_static("6"),
            Code::PermissionDenied => HeaderValue::from_static("7"),
            Code::ResourceExhausted => HeaderValue::from_static("8"),
            Code::FailedPrecondition => HeaderValue::from_static("9"),
            Code::Aborted => HeaderValue::from_static("10"),
            Code::OutOfRange => HeaderValue::from_static("11"),
            Code::Unimplemented => HeaderValue::from_static("12"),
            Code::Internal => HeaderValue::from_static("13"),
            Code::Unavailable => HeaderValue::from_static("14"),
            Code::DataLoss => HeaderValue::from_static("15"),
            Code::Unauthenticated => HeaderValue::from_static("16"),
        }
    }

    fn parse_err() -> Code {
        trace!("error parsing grpc-status");
        Code::Unknown
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Code {
        Code::from_i32(i)
    }
}

impl Status {
    /// Create a new `Status` with the associated code and message.
    ///
    /// An OK status never carries a message; one passed here is dropped.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        let message = match code {
            Code::Ok => String::new(),
            _ => message.into(),
        };
        Status {
            code,
            message,
            details: Bytes::new(),
            metadata: MetadataMap::new(),
        }
    }

    /// An OK status. Carries no message and no details.
    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Status {
        Status::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Status {
        Status::new(Code::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Status {
        Status::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Status {
        Status::new(Code::FailedPrecondition, message)
    }

    pub fn aborted(message: impl Into<String>) -> Status {
        Status::new(Code::Aborted, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Status {
        Status::new(Code::OutOfRange, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn data_loss(message: impl Into<String>) -> Status {
        Status::new(Code::DataLoss, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Status {
        Status::new(Code::Unauthenticated, message)
    }

    /// Create a `Status` with the associated code, message and opaque details.
    pub fn with_details(code: Code, message: impl Into<String>, details: Bytes) -> Status {
        Status {
            code,
            message: message.into(),
            details,
            metadata: MetadataMap::new(),
        }
    }

    /// Create a `Status` carrying trailer metadata alongside the code.
    pub fn with_metadata(code: Code, message: impl Into<String>, metadata: MetadataMap) -> Status {
        Status {
            code,
            message: message.into(),
            details: Bytes::new(),
            metadata,
        }
    }

    /// Extract a `Status` from an arbitrary error, walking the source chain
    /// for a transported status or a known transport error. Errors with no
    /// recognizable cause map to `Unknown`.
    pub fn from_error(err: Box<dyn Error + Send + Sync + 'static>) -> Status {
        Status::try_from_error(err)
            .unwrap_or_else(|err| Status::new(Code::Unknown, err.to_string()))
    }

    /// Like [`Status::from_error`], but returns the original error when no
    /// status can be inferred from the chain.
    pub fn try_from_error(
        err: Box<dyn Error + Send + Sync + 'static>,
    ) -> Result<Status, Box<dyn Error + Send + Sync + 'static>> {
        let err = match err.downcast::<Status>() {
            Ok(status) => return Ok(*status),
            Err(err) => err,
        };

        let err = match err.downcast::<h2::Error>() {
            Ok(h2) => return Ok(Status::from_h2_error(&h2)),
            Err(err) => err,
        };

        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(status) = cause.downcast_ref::<Status>() {
                return Ok(status.clone());
            }
            if let Some(h2) = cause.downcast_ref::<h2::Error>() {
                return Ok(Status::from_h2_error(h2));
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return Ok(Status::from_io_error(io));
            }
            source = cause.source();
        }

        Err(err)
    }

    /// Maps an `h2` stream or connection error onto a status.
    ///
    /// A remote RST_STREAM(CANCEL) is a cancellation; refused streams and
    /// torn connections are retryable unavailability; everything else is a
    /// protocol-level internal error.
    pub(crate) fn from_h2_error(err: &h2::Error) -> Status {
        let code = match err.reason() {
            Some(h2::Reason::CANCEL) => Code::Cancelled,
            Some(h2::Reason::NO_ERROR)
            | Some(h2::Reason::REFUSED_STREAM)
            | Some(h2::Reason::ENHANCE_YOUR_CALM) => Code::Unavailable,
            Some(_) => Code::Internal,
            None if err.is_io() => Code::Unavailable,
            None => Code::Unknown,
        };
        debug!("mapping h2 error ({}) to status {:?}", err, code);
        Status::new(code, format!("h2 protocol error: {err}"))
    }

    pub(crate) fn from_io_error(err: &std::io::Error) -> Status {
        let code = match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => Code::Unavailable,
            std::io::ErrorKind::TimedOut => Code::DeadlineExceeded,
            _ => Code::Unknown,
        };
        Status::new(code, err.to_string())
    }

    /// Get the canonical code of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the opaque details of this `Status`.
    pub fn details(&self) -> &[u8] {
        &self.details
    }

    /// Trailer metadata received with this status.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Reads a status out of a header/trailer map, if one is present.
    pub(crate) fn from_header_map(header_map: &HeaderMap) -> Option<Status> {
        header_map.get(GRPC_STATUS_HEADER).map(|code| {
            let code = Code::from_bytes(code.as_ref());
            let error_message = header_map
                .get(GRPC_MESSAGE_HEADER)
                .map(|header| {
                    percent_decode(header.as_bytes())
                        .decode_utf8()
                        .map(|cow| cow.to_string())
                })
                .unwrap_or_else(|| Ok(String::new()));

            let details = header_map
                .get(GRPC_STATUS_DETAILS_HEADER)
                .and_then(|h| match crate::metadata::decode_bin_value(h.as_bytes()) {
                    Ok(details) => Some(Bytes::from(details)),
                    Err(err) => {
                        debug!("error decoding grpc-status-details-bin: {}", err);
                        None
                    }
                })
                .unwrap_or_default();

            let mut other_headers = header_map.clone();
            other_headers.remove(GRPC_STATUS_HEADER);
            other_headers.remove(GRPC_MESSAGE_HEADER);
            other_headers.remove(GRPC_STATUS_DETAILS_HEADER);

            match error_message {
                Ok(message) => Status {
                    code,
                    message,
                    details,
                    metadata: MetadataMap::from_headers(other_headers),
                },
                Err(err) => {
                    debug!("error decoding grpc-message: {}", err);
                    Status {
                        code,
                        message: format!("error decoding grpc-message: {err}"),
                        details,
                        metadata: MetadataMap::from_headers(other_headers),
                    }
                }
            }
        })
    }

    /// Writes this status into `header_map`, as trailer entries.
    pub(crate) fn add_header(&self, header_map: &mut HeaderMap) -> Result<(), Status> {
        header_map.extend(self.metadata.clone().into_sanitized_headers());

        header_map.insert(GRPC_STATUS_HEADER, self.code.to_header_value());

        if !self.message.is_empty() {
            let to_write = Bytes::copy_from_slice(
                percent_encode(self.message.as_bytes(), GRPC_MESSAGE_ENCODE_SET)
                    .to_string()
                    .as_bytes(),
            );
            header_map.insert(
                GRPC_MESSAGE_HEADER,
                HeaderValue::from_maybe_shared(to_write)
                    .map_err(|_| Status::internal("Invalid status message"))?,
            );
        }

        if !self.details.is_empty() {
            let details = crate::metadata::encode_bin_value(&self.details[..]);
            header_map.insert(
                GRPC_STATUS_DETAILS_HEADER,
                HeaderValue::from_maybe_shared(details)
                    .map_err(|_| Status::internal("Invalid status details"))?,
            );
        }

        Ok(())
    }

    /// Builds the trailer map for this status.
    pub(crate) fn to_header_map(&self) -> Result<HeaderMap, Status> {
        let mut header_map = HeaderMap::with_capacity(3 + self.metadata.len());
        self.add_header(&mut header_map)?;
        Ok(header_map)
    }

    /// Whether a call failing with this status may be transparently retried
    /// on another transport because the request was never processed.
    pub(crate) fn is_refused_stream(&self) -> bool {
        self.code == Code::Unavailable && self.message.contains("refused")
    }
}

/// Derives the final status from the frame that ended the response stream.
///
/// `trailers` is the trailer map if one was received. A clean end of stream
/// without a `grpc-status` is a protocol violation (`Internal`); an unclean
/// end maps to `Unavailable`. `Ok` means the stream finished with an OK
/// status.
pub(crate) fn infer_grpc_status(
    trailers: Option<&HeaderMap>,
    clean_eos: bool,
) -> Result<(), Status> {
    if let Some(trailers) = trailers {
        if let Some(status) = Status::from_header_map(trailers) {
            if status.code() == Code::Ok {
                return Ok(());
            }
            return Err(status);
        }
    }

    let status = if clean_eos {
        Status::internal("protocol error: missing grpc-status in trailers")
    } else {
        Status::unavailable("stream closed before trailers were received")
    };
    Err(status)
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.code);
        builder.field("message", &self.message);

        if !self.details.is_empty() {
            builder.field("details", &self.details);
        }

        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {:?}, message: {:?}",
            self.code(),
            self.message()
        )
    }
}

impl Error for Status {}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::from_io_error(&err)
    }
}

impl From<h2::Error> for Status {
    fn from(err: h2::Error) -> Self {
        Status::from_h2_error(&err)
    }
}

/// Strips the protocol's own entries before handing a trailer map back to
/// the application as metadata.
pub(crate) fn strip_reserved(header_map: &mut HeaderMap) {
    header_map.remove(GRPC_TIMEOUT_HEADER);
    header_map.remove(GRPC_STATUS_HEADER);
    header_map.remove(GRPC_MESSAGE_HEADER);
    header_map.remove(GRPC_STATUS_DETAILS_HEADER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Nested(Box<dyn Error + Send + Sync>);

    impl fmt::Display for Nested {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "nested: {}", self.0)
        }
    }

    impl Error for Nested {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&*self.0 as &(dyn Error + 'static))
        }
    }

    #[test]
    fn code_round_trips_through_header_value() {
        for i in 0..=16 {
            let code = Code::from_i32(i);
            let value = code.to_header_value();
            assert_eq!(Code::from_bytes(value.as_bytes()), code);
        }
    }

    #[test]
    fn out_of_range_code_is_unknown() {
        assert_eq!(Code::from_i32(-1), Code::Unknown);
        assert_eq!(Code::from_i32(17), Code::Unknown);
        assert_eq!(Code::from_bytes(b"42"), Code::Unknown);
    }

    #[test]
    fn message_percent_encoding_round_trip() {
        let status = Status::internal("n% not as expected: 42\u{7f}");
        let map = status.to_header_map().unwrap();
        let decoded = Status::from_header_map(&map).unwrap();
        assert_eq!(decoded.code(), Code::Internal);
        assert_eq!(decoded.message(), status.message());
    }

    #[test]
    fn from_error_finds_nested_status() {
        let inner = Status::aborted("contention");
        let err = Nested(Box::new(inner));
        let status = Status::from_error(Box::new(err));
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "contention");
    }

    #[test]
    fn missing_status_defaults() {
        // Clean end of stream without grpc-status is a protocol violation.
        let status = infer_grpc_status(None, true).unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        // Unclean end is unavailability.
        let status = infer_grpc_status(None, false).unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn ok_trailers_end_the_stream_without_error() {
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS_HEADER, HeaderValue::from_static("0"));
        assert!(infer_grpc_status(Some(&trailers), true).is_ok());
    }
}
