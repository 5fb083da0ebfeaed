//! Protocol routing and the pluggable control-plane behavior.
//!
//! A completed request is matched to one of the four operations by URL
//! suffix, in a fixed precedence order — the suffixes overlap, so order
//! matters: `init/error` must be checked before the per-invocation error
//! path, of which it is itself a suffix match candidate.
//!
//! | Precedence | Suffix | Operation |
//! |---|---|---|
//! | 1 | `init/error` | `process_init_error` |
//! | 2 | `invocation/next` | `get_invocation` |
//! | 3 | `invocation/{id}/response` | `process_response` |
//! | 4 | `invocation/{id}/error` | `process_error` |
//! | 5 | anything else | 404 |
//!
//! The behavior is a capability trait so test and production control
//! planes are interchangeable at construction time. Routing itself is
//! pure and synchronous; the only suspension points live in the
//! connection task around it.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::pipeline::CompletedRequest;
use super::response::SynthesizedResponse;
use crate::protocol::{ErrorResponse, GetInvocationError, ReportErrorError, ReportResultError};

/// Reserved request id that makes the double stall before closing.
/// Only honored when failure simulation is enabled.
pub const SENTINEL_TIMEOUT: &str = "timeout";
/// Reserved request id that makes the double drop the connection.
/// Only honored when failure simulation is enabled.
pub const SENTINEL_DISCONNECT: &str = "disconnect";

/// The control plane's side of the protocol, pluggable per construction.
///
/// Implementations must be cheap and non-blocking: these run on the
/// connection task between socket reads.
pub trait ControlPlaneBehavior: Send + Sync {
    /// Hand out the next invocation as (request id, payload).
    fn get_invocation(&self) -> Result<(String, Bytes), GetInvocationError>;

    /// Accept a success payload for the given invocation.
    fn process_response(
        &self,
        request_id: &str,
        payload: Option<&[u8]>,
    ) -> Result<(), ReportResultError>;

    /// Accept an error report for the given invocation.
    fn process_error(
        &self,
        request_id: &str,
        error: &ErrorResponse,
    ) -> Result<(), ReportErrorError>;

    /// Accept an initialization-error report.
    fn process_init_error(&self, error: &ErrorResponse) -> Result<(), ReportErrorError>;
}

/// Connection-level action simulated instead of a normal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationHook {
    /// Sleep this long, then close without responding.
    DelayThenClose(Duration),
    /// Close immediately; zero response bytes.
    Disconnect,
}

/// What the connection task should do with a routed request.
#[derive(Debug)]
pub enum RouteOutcome {
    Respond(SynthesizedResponse),
    Hook(SimulationHook),
}

/// Route one completed request through the behavior.
///
/// `failure_simulation` gates the reserved sentinel request ids; with it
/// off they are ordinary ids and produce normal responses.
pub fn route(
    request: &CompletedRequest,
    behavior: &dyn ControlPlaneBehavior,
    failure_simulation: bool,
) -> RouteOutcome {
    let path = request.head.path.as_str();
    debug!(method = %request.head.method, path = %path, "routing request");

    if path.ends_with("/init/error") {
        let outcome = match parse_error_body(request) {
            Some(error) => status_of(behavior.process_init_error(&error).map_err(|e| e.status_code())),
            None => SynthesizedResponse::status_only(400),
        };
        return RouteOutcome::Respond(outcome);
    }

    if path.ends_with("/invocation/next") {
        return match behavior.get_invocation() {
            Ok((request_id, payload)) => {
                if failure_simulation && request_id == SENTINEL_TIMEOUT {
                    let millis = std::str::from_utf8(&payload)
                        .ok()
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(0);
                    RouteOutcome::Hook(SimulationHook::DelayThenClose(Duration::from_millis(
                        millis,
                    )))
                } else if failure_simulation && request_id == SENTINEL_DISCONNECT {
                    RouteOutcome::Hook(SimulationHook::Disconnect)
                } else {
                    RouteOutcome::Respond(SynthesizedResponse::next_invocation(
                        &request_id,
                        payload,
                    ))
                }
            }
            Err(kind) => {
                RouteOutcome::Respond(SynthesizedResponse::status_only(kind.status_code()))
            }
        };
    }

    if path.ends_with("/response") {
        let outcome = match invocation_id(path, "response") {
            Some(request_id) => status_of(
                behavior
                    .process_response(request_id, request.body.as_deref())
                    .map_err(|e| e.status_code()),
            ),
            None => SynthesizedResponse::status_only(400),
        };
        return RouteOutcome::Respond(outcome);
    }

    if path.ends_with("/error") {
        let outcome = match invocation_id(path, "error") {
            Some(request_id) => match parse_error_body(request) {
                Some(error) => status_of(
                    behavior
                        .process_error(request_id, &error)
                        .map_err(|e| e.status_code()),
                ),
                None => SynthesizedResponse::status_only(400),
            },
            None => SynthesizedResponse::status_only(400),
        };
        return RouteOutcome::Respond(outcome);
    }

    debug!(path = %path, "no route matched");
    RouteOutcome::Respond(SynthesizedResponse::status_only(404))
}

fn status_of(result: Result<(), u16>) -> SynthesizedResponse {
    match result {
        Ok(()) => SynthesizedResponse::accepted(),
        Err(status) => SynthesizedResponse::status_only(status),
    }
}

/// Extract `{id}` from a `…/invocation/{id}/<kind>` path.
///
/// Returns `None` (a 400 at the caller) when the path does not have the
/// invocation shape around its final segment.
fn invocation_id<'a>(path: &'a str, kind: &str) -> Option<&'a str> {
    let mut segments = path.split('/').filter(|s| !s.is_empty()).rev();
    if segments.next() != Some(kind) {
        return None;
    }
    let id = segments.next()?;
    if segments.next() != Some("invocation") {
        return None;
    }
    Some(id)
}

/// Parse the request body as a JSON error payload; `None` means 400.
fn parse_error_body(request: &CompletedRequest) -> Option<ErrorResponse> {
    let body = request.body.as_ref()?;
    serde_json::from_slice(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::decoder::RequestHead;
    use std::sync::Mutex;

    /// Behavior that records every call and answers from canned results.
    #[derive(Default)]
    struct Recording {
        invocation: Option<Result<(String, Bytes), GetInvocationError>>,
        responses: Mutex<Vec<(String, Option<Vec<u8>>)>>,
        errors: Mutex<Vec<(String, ErrorResponse)>>,
        init_errors: Mutex<Vec<ErrorResponse>>,
    }

    impl ControlPlaneBehavior for Recording {
        fn get_invocation(&self) -> Result<(String, Bytes), GetInvocationError> {
            self.invocation
                .clone()
                .unwrap_or(Err(GetInvocationError::InternalServerError))
        }

        fn process_response(
            &self,
            request_id: &str,
            payload: Option<&[u8]>,
        ) -> Result<(), ReportResultError> {
            self.responses
                .lock()
                .expect("not poisoned")
                .push((request_id.to_owned(), payload.map(<[u8]>::to_vec)));
            Ok(())
        }

        fn process_error(
            &self,
            request_id: &str,
            error: &ErrorResponse,
        ) -> Result<(), ReportErrorError> {
            self.errors
                .lock()
                .expect("not poisoned")
                .push((request_id.to_owned(), error.clone()));
            Ok(())
        }

        fn process_init_error(&self, error: &ErrorResponse) -> Result<(), ReportErrorError> {
            self.init_errors
                .lock()
                .expect("not poisoned")
                .push(error.clone());
            Ok(())
        }
    }

    fn request(method: &str, path: &str, body: Option<&[u8]>) -> CompletedRequest {
        CompletedRequest {
            head: RequestHead {
                method: method.to_owned(),
                path: path.to_owned(),
                content_length: body.map_or(0, <[u8]>::len),
            },
            body: body.map(Bytes::copy_from_slice),
        }
    }

    fn respond(outcome: RouteOutcome) -> SynthesizedResponse {
        match outcome {
            RouteOutcome::Respond(response) => response,
            RouteOutcome::Hook(hook) => panic!("expected a response, got hook {hook:?}"),
        }
    }

    #[test]
    fn init_error_takes_precedence_over_error() {
        let behavior = Recording::default();
        let body = br#"{"errorType":"Init","errorMessage":"boom"}"#;
        let outcome = route(
            &request("POST", "/2018-06-01/runtime/init/error", Some(body)),
            &behavior,
            false,
        );
        assert_eq!(respond(outcome).status, 202);
        assert_eq!(behavior.init_errors.lock().expect("not poisoned").len(), 1);
        assert!(behavior.errors.lock().expect("not poisoned").is_empty());
    }

    #[test]
    fn next_invocation_success_has_headers_and_payload() {
        let behavior = Recording {
            invocation: Some(Ok(("req-7".to_owned(), Bytes::from_static(b"{}")))),
            ..Default::default()
        };
        let outcome = route(
            &request("GET", "/2018-06-01/runtime/invocation/next", None),
            &behavior,
            false,
        );
        let response = respond(outcome);
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.len(), 4);
        assert_eq!(response.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn get_invocation_failure_maps_to_exact_status() {
        let behavior = Recording {
            invocation: Some(Err(GetInvocationError::TooManyRequests)),
            ..Default::default()
        };
        let outcome = route(
            &request("GET", "/2018-06-01/runtime/invocation/next", None),
            &behavior,
            false,
        );
        let response = respond(outcome);
        assert_eq!(response.status, 429);
        assert!(response.body.is_none());
    }

    #[test]
    fn response_path_extracts_id_and_forwards_payload() {
        let behavior = Recording::default();
        let outcome = route(
            &request(
                "POST",
                "/2018-06-01/runtime/invocation/req-9/response",
                Some(b"payload"),
            ),
            &behavior,
            false,
        );
        assert_eq!(respond(outcome).status, 202);
        let calls = behavior.responses.lock().expect("not poisoned");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "req-9");
        assert_eq!(calls[0].1.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn error_path_requires_well_formed_json() {
        let behavior = Recording::default();
        let outcome = route(
            &request(
                "POST",
                "/2018-06-01/runtime/invocation/req-9/error",
                Some(b"not json"),
            ),
            &behavior,
            false,
        );
        assert_eq!(respond(outcome).status, 400);
        assert!(behavior.errors.lock().expect("not poisoned").is_empty());
    }

    #[test]
    fn missing_id_segment_is_bad_request() {
        let behavior = Recording::default();
        let outcome = route(&request("POST", "/response", Some(b"x")), &behavior, false);
        assert_eq!(respond(outcome).status, 400);
    }

    #[test]
    fn unknown_path_is_not_found() {
        let behavior = Recording::default();
        let outcome = route(&request("GET", "/health", None), &behavior, false);
        let response = respond(outcome);
        assert_eq!(response.status, 404);
        assert!(response.body.is_none());
    }

    #[test]
    fn sentinel_ids_are_ordinary_without_the_flag() {
        let behavior = Recording {
            invocation: Some(Ok((SENTINEL_DISCONNECT.to_owned(), Bytes::from_static(b"{}")))),
            ..Default::default()
        };
        let outcome = route(
            &request("GET", "/2018-06-01/runtime/invocation/next", None),
            &behavior,
            false,
        );
        assert_eq!(respond(outcome).status, 200);
    }

    #[test]
    fn timeout_sentinel_parses_delay_from_payload() {
        let behavior = Recording {
            invocation: Some(Ok((SENTINEL_TIMEOUT.to_owned(), Bytes::from_static(b"50")))),
            ..Default::default()
        };
        let outcome = route(
            &request("GET", "/2018-06-01/runtime/invocation/next", None),
            &behavior,
            true,
        );
        assert!(matches!(
            outcome,
            RouteOutcome::Hook(SimulationHook::DelayThenClose(d)) if d == Duration::from_millis(50)
        ));
    }

    #[test]
    fn disconnect_sentinel_closes_immediately() {
        let behavior = Recording {
            invocation: Some(Ok((SENTINEL_DISCONNECT.to_owned(), Bytes::new()))),
            ..Default::default()
        };
        let outcome = route(
            &request("GET", "/2018-06-01/runtime/invocation/next", None),
            &behavior,
            true,
        );
        assert!(matches!(
            outcome,
            RouteOutcome::Hook(SimulationHook::Disconnect)
        ));
    }
}
