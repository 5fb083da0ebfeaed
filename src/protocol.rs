//! Wire-level data model shared by the client and the test double.
//!
//! Both halves of the protocol must agree bit-for-bit on the endpoint
//! paths, the required header names, and the status-code taxonomy. All of
//! those fixed values live here so there is exactly one definition of each.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeApiError;

/// Runtime API version prefix used by the client when building URLs.
///
/// The server routes by path *suffix*, so it accepts any version prefix.
pub const API_VERSION: &str = "2018-06-01";

/// Header carrying the invocation's opaque request id.
pub const HEADER_REQUEST_ID: &str = "Lambda-Runtime-Aws-Request-Id";
/// Header carrying the absolute invocation deadline in epoch milliseconds.
pub const HEADER_DEADLINE_MS: &str = "Lambda-Runtime-Deadline-Ms";
/// Header carrying the ARN of the function being invoked.
pub const HEADER_FUNCTION_ARN: &str = "Lambda-Runtime-Invoked-Function-Arn";
/// Header carrying the tracing context for the invocation.
pub const HEADER_TRACE_ID: &str = "Lambda-Runtime-Trace-Id";

/// Header set by the client on error-report and init-error calls.
pub const HEADER_ERROR_TYPE: &str = "Lambda-Runtime-Function-Error-Type";
/// Fixed value of [`HEADER_ERROR_TYPE`]; the control plane only
/// distinguishes handled from unhandled, and runtime-reported errors are
/// always unhandled.
pub const ERROR_TYPE_UNHANDLED: &str = "Unhandled";

/// User-agent identifier sent on error-report calls.
pub const USER_AGENT: &str = concat!("lambda-runtime-api/", env!("CARGO_PKG_VERSION"));

/// One unit of work handed out by the control plane.
///
/// Built from the response headers of a successful next-invocation call
/// and discarded once its result or error has been reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Opaque token identifying this invocation, supplied by the control plane.
    pub request_id: String,
    /// Absolute wall-clock deadline, milliseconds since the Unix epoch.
    pub deadline_epoch_ms: u64,
    /// ARN of the function being invoked.
    pub invoked_function_arn: String,
    /// Tracing context propagated from the control plane.
    pub trace_id: String,
}

impl Invocation {
    /// Extract an invocation from next-invocation response headers.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeApiError::InvocationMissingHeader`] naming the first
    /// header that is absent, non-UTF-8, or (for the deadline) not a valid
    /// integer.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RuntimeApiError> {
        let request_id = required_header(headers, HEADER_REQUEST_ID)?;
        let deadline_epoch_ms = required_header(headers, HEADER_DEADLINE_MS)?
            .parse::<u64>()
            .map_err(|_| RuntimeApiError::InvocationMissingHeader(HEADER_DEADLINE_MS))?;
        let invoked_function_arn = required_header(headers, HEADER_FUNCTION_ARN)?;
        let trace_id = required_header(headers, HEADER_TRACE_ID)?;

        Ok(Self {
            request_id,
            deadline_epoch_ms,
            invoked_function_arn,
            trace_id,
        })
    }
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, RuntimeApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or(RuntimeApiError::InvocationMissingHeader(name))
}

/// JSON error payload exchanged on the error-report paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error classification, e.g. `"FunctionError"`.
    #[serde(rename = "errorType")]
    pub error_type: String,
    /// Human-readable description.
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

impl ErrorResponse {
    /// Convenience constructor.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }
}

/// A function failure presented to the report calls.
///
/// A [`FunctionError::Reported`] value is forwarded verbatim; anything else
/// is synthesized into a generic `"FunctionError"` payload carrying the
/// failure's textual description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionError {
    /// The function produced a structured error; forwarded unmodified.
    Reported(ErrorResponse),
    /// The function failed without structure; only a description is known.
    Unexpected(String),
}

impl FunctionError {
    /// Wire representation of this failure.
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            FunctionError::Reported(error) => error.clone(),
            FunctionError::Unexpected(description) => {
                ErrorResponse::new("FunctionError", description.clone())
            }
        }
    }
}

/// Result of executing one invocation, as reported back to the control plane.
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    /// The function completed; an empty payload is legal.
    Success(Option<Bytes>),
    /// The function failed.
    Failure(FunctionError),
}

/// Control-plane failure when handing out the next invocation.
///
/// The numeric codes are stable wire values and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetInvocationError {
    BadRequest,
    TooManyRequests,
    InternalServerError,
}

impl GetInvocationError {
    /// Fixed HTTP status transmitted for this failure.
    pub fn status_code(self) -> u16 {
        match self {
            GetInvocationError::BadRequest => 400,
            GetInvocationError::TooManyRequests => 429,
            GetInvocationError::InternalServerError => 500,
        }
    }
}

/// Control-plane failure when accepting a success payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResultError {
    BadRequest,
    PayloadTooLarge,
    TooManyRequests,
    InternalServerError,
}

impl ReportResultError {
    /// Fixed HTTP status transmitted for this failure.
    pub fn status_code(self) -> u16 {
        match self {
            ReportResultError::BadRequest => 400,
            ReportResultError::PayloadTooLarge => 413,
            ReportResultError::TooManyRequests => 429,
            ReportResultError::InternalServerError => 500,
        }
    }
}

/// Control-plane failure when accepting an error or init-error report.
///
/// `InvalidErrorShape` reuses the non-standard code 299 as a domain signal;
/// it is not a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportErrorError {
    InvalidErrorShape,
    BadRequest,
    InternalServerError,
}

impl ReportErrorError {
    /// Fixed HTTP status transmitted for this failure.
    pub fn status_code(self) -> u16 {
        match self {
            ReportErrorError::InvalidErrorShape => 299,
            ReportErrorError::BadRequest => 400,
            ReportErrorError::InternalServerError => 500,
        }
    }
}
