//! Domain failures of the monitoring engine.
//!
//! Everything in the crate returns `anyhow::Result`; the failures that callers
//! need to tell apart are raised as a `MonitorError` and recovered with
//! [`MonitorError::kind_of`].

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceUnavailable,
    NoFrameAvailable,
    ClassifierError,
    DuplicateStreamId,
    StreamNotFound,
    InvalidStreamConfig,
}

impl ErrorKind {
    /// Stable machine-readable code, used in events and API bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorKind::NoFrameAvailable => "NO_FRAME_AVAILABLE",
            ErrorKind::ClassifierError => "CLASSIFIER_ERROR",
            ErrorKind::DuplicateStreamId => "DUPLICATE_STREAM_ID",
            ErrorKind::StreamNotFound => "STREAM_NOT_FOUND",
            ErrorKind::InvalidStreamConfig => "INVALID_STREAM_CONFIG",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug)]
pub struct MonitorError {
    pub kind: ErrorKind,
    pub message: String,
}

impl MonitorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn source_unavailable(address: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::SourceUnavailable,
            format!("cannot open source {}: {}", address, reason),
        )
    }

    pub fn no_frame(address: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::NoFrameAvailable,
            format!("no frame from {}: {}", address, reason),
        )
    }

    pub fn classifier(reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ClassifierError, reason.to_string())
    }

    pub fn duplicate_stream(id: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateStreamId,
            format!("stream id {} already registered", id),
        )
    }

    pub fn stream_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::StreamNotFound,
            format!("stream {} not found", id),
        )
    }

    pub fn invalid_config(reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidStreamConfig, reason.to_string())
    }

    /// Kind of the first `MonitorError` in an error chain, if any.
    pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<MonitorError>())
            .map(|e| e.kind)
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for MonitorError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_added_context() {
        let err: anyhow::Result<()> = Err(MonitorError::stream_not_found("abc").into());
        let err = err.context("manual capture").unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::StreamNotFound));
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(MonitorError::kind_of(&err), None);
    }
}
