//! Runtime API wire protocol: polling client and control-plane test double.
//!
//! Two symmetric halves that agree bit-for-bit on paths, header names, and
//! status codes:
//!
//! - [`RuntimeClient`] — polls the control plane for invocations, executes
//!   nothing itself, and reports results or failures, classifying
//!   transport errors into a small stable set.
//! - [`MockControlPlane`] — a protocol-accurate test double serving the
//!   control plane's side over real HTTP connections, with keep-alive and
//!   pipelining, driven by a pluggable [`ControlPlaneBehavior`].
//!
//! The long-running poll loop that drives the client, and any retry
//! policy, live outside this crate.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, RuntimeClient};
pub use error::{RuntimeApiError, RuntimeApiResult};
pub use protocol::{
    ErrorResponse, FunctionError, GetInvocationError, Invocation, InvocationOutcome,
    ReportErrorError, ReportResultError,
};
pub use server::router::ControlPlaneBehavior;
pub use server::{MockControlPlane, ServerConfig, ServerError};
