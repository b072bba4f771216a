//! Failure taxonomy for a pipeline run.
//!
//! Every stage returns [`PipelineError`]; the driver in
//! [`pipeline`](crate::pipeline) converts it into a [`ReasonCode`] plus
//! details on an `ok = false` result. Nothing here ever reaches the caller
//! as an `Err`.

use serde::Serialize;

/// Stable, serializable identifier for why a run produced no (or no new) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReasonCode {
    NoSnapshotFound,
    TransportFailed,
    NoMatchingEntry,
    ParseFailed,
    Cancelled,
    UnexpectedFailure,
    /// The run succeeded but every record was dropped, or the file was empty.
    EmptyResult,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::NoSnapshotFound => "NoSnapshotFound",
            ReasonCode::TransportFailed => "TransportFailed",
            ReasonCode::NoMatchingEntry => "NoMatchingEntry",
            ReasonCode::ParseFailed => "ParseFailed",
            ReasonCode::Cancelled => "Cancelled",
            ReasonCode::UnexpectedFailure => "UnexpectedFailure",
            ReasonCode::EmptyResult => "EmptyResult",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum PipelineError {
    NoSnapshotFound {
        index_url: String,
    },
    TransportFailed {
        url: String,
        status: Option<u16>,
        message: String,
    },
    NoMatchingEntry,
    ParseFailed {
        entry: String,
        message: String,
    },
    Cancelled {
        message: String,
    },
    UnexpectedFailure {
        message: String,
    },
}

impl PipelineError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            PipelineError::NoSnapshotFound { .. } => ReasonCode::NoSnapshotFound,
            PipelineError::TransportFailed { .. } => ReasonCode::TransportFailed,
            PipelineError::NoMatchingEntry => ReasonCode::NoMatchingEntry,
            PipelineError::ParseFailed { .. } => ReasonCode::ParseFailed,
            PipelineError::Cancelled { .. } => ReasonCode::Cancelled,
            PipelineError::UnexpectedFailure { .. } => ReasonCode::UnexpectedFailure,
        }
    }

    pub(crate) fn transport(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        PipelineError::TransportFailed {
            url: url.to_string(),
            status,
            message: message.into(),
        }
    }

    /// Map an I/O error raised while reading the archive stream.
    ///
    /// Reads cut short by a [`CancelToken`](crate::transport::CancelToken)
    /// become `Cancelled`; anything else is a broken transfer or corrupt
    /// framing.
    pub(crate) fn from_stream_io(url: &str, err: std::io::Error) -> Self {
        if crate::transport::is_cancellation(&err) {
            PipelineError::Cancelled {
                message: err.to_string(),
            }
        } else {
            PipelineError::transport(url, None, err.to_string())
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::NoSnapshotFound { index_url } => {
                write!(f, "no snapshot archive found on {}", index_url)
            }
            PipelineError::TransportFailed {
                url,
                status: Some(status),
                message,
            } => write!(f, "HTTP {} fetching {}: {}", status, url, message),
            PipelineError::TransportFailed {
                url,
                status: None,
                message,
            } => write!(f, "failed to fetch {}: {}", url, message),
            PipelineError::NoMatchingEntry => {
                write!(f, "no incident data file found inside the snapshot archive")
            }
            PipelineError::ParseFailed { entry, message } => {
                write!(f, "failed to parse {}: {}", entry, message)
            }
            PipelineError::Cancelled { message } => write!(f, "run cancelled: {}", message),
            PipelineError::UnexpectedFailure { message } => {
                write!(f, "unexpected failure: {}", message)
            }
        }
    }
}

impl std::error::Error for PipelineError {}
