use std::io;
use std::net;

pub type PipeResult<T> = Result<T, PipeError>;

/// Two-level error plumbing for the pipeline. `Wait` means the operation
/// cannot make progress yet (missing octets, exhausted capacity) and should
/// be retried once more input or capacity arrives; `Fatal` conditions
/// terminate the message or the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum PipeError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorType {
    /// Octets that do not decode as AMQP.
    Malformed,
    /// A section appeared out of the mandated order.
    SectionOrder,
    /// Router annotations present on a non-router ingress.
    AnnotationsForbidden,
    /// Router annotations missing on a router ingress.
    AnnotationsMissing,
    /// Cumulative message size exceeded the configured maximum.
    Oversize,
    /// Classical content access after cut-through was enabled.
    CutThroughActive,
    /// The producing side aborted the message.
    Aborted,
    /// The counterpart of this object has been freed.
    Gone,
    Serialization,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for PipeError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => PipeError::Wait,
            kind => PipeError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for PipeError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        PipeError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for PipeResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(PipeError::Wait) => false,
            _ => true,
        }
    }
}
