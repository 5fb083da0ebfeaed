//! Outbound response synthesis and raw socket writes.
//!
//! Responses are hand-built and written straight to the socket: status
//! line, headers, blank line, body. `Content-Length` is always present
//! (0 when bodyless) and `Connection: close` is added exactly when the
//! server runs without keep-alive. Write failures are logged and
//! swallowed: a partially written response cannot be recovered, and the
//! connection lifecycle proceeds regardless.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::error;
use uuid::Uuid;

use crate::protocol::{
    HEADER_DEADLINE_MS, HEADER_FUNCTION_ARN, HEADER_REQUEST_ID, HEADER_TRACE_ID,
};

/// Function ARN reported by the test double on every invocation.
pub const MOCK_FUNCTION_ARN: &str =
    "arn:aws:lambda:us-east-1:123456789012:function:mock-control-plane";

/// Invocation deadline granted by the test double, relative to response
/// construction.
const INVOCATION_DEADLINE: Duration = Duration::from_secs(60);

/// A fully determined response, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Bytes>,
}

impl SynthesizedResponse {
    /// A header-and-status-only response with an empty body.
    pub fn status_only(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    /// The 202 acknowledgement for report and init-error operations.
    pub fn accepted() -> Self {
        Self::status_only(202)
    }

    /// A successful next-invocation response: 200, the invocation payload,
    /// and the four required headers. The deadline is 60 seconds from now
    /// in epoch milliseconds; the trace id is freshly generated.
    pub fn next_invocation(request_id: &str, payload: Bytes) -> Self {
        let deadline_epoch_ms = epoch_millis(SystemTime::now() + INVOCATION_DEADLINE);
        Self {
            status: 200,
            headers: vec![
                (HEADER_REQUEST_ID, request_id.to_owned()),
                (HEADER_FUNCTION_ARN, MOCK_FUNCTION_ARN.to_owned()),
                (HEADER_TRACE_ID, generate_trace_id()),
                (HEADER_DEADLINE_MS, deadline_epoch_ms.to_string()),
            ],
            body: Some(payload),
        }
    }
}

/// Write a response as status line, headers, body, flush — in that order.
///
/// A failed write is logged and swallowed; the caller decides the
/// connection's fate independently of the write outcome.
pub async fn write_response<W>(stream: &mut W, response: &SynthesizedResponse, keep_alive: bool)
where
    W: AsyncWrite + Unpin,
{
    let body_len = response.body.as_ref().map_or(0, Bytes::len);

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {body_len}\r\n"));
    if !keep_alive {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");

    if let Err(e) = stream.write_all(head.as_bytes()).await {
        error!(error = %e, status = response.status, "failed to write response head");
        return;
    }
    if let Some(body) = &response.body {
        if let Err(e) = stream.write_all(body).await {
            error!(error = %e, status = response.status, "failed to write response body");
            return;
        }
    }
    if let Err(e) = stream.flush().await {
        error!(error = %e, status = response.status, "failed to flush response");
    }
}

/// Generate a trace id in the `Root=…;Parent=…;Sampled=1` format.
pub fn generate_trace_id() -> String {
    let root = Uuid::new_v4().simple().to_string();
    let parent = Uuid::new_v4().simple().to_string();
    format!(
        "Root=1-{}-{};Parent={};Sampled=1",
        &root[..8],
        &root[8..32],
        &parent[..16]
    )
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        299 => "Invalid Error Shape",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
