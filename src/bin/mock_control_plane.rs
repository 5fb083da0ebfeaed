//! Standalone mock control plane.
//!
//! Serves the runtime protocol with a canned behavior that hands out the
//! same invocation payload on every poll and accepts all reports. Useful
//! for exercising a runtime client by hand.
//!
//! ```bash
//! # Start with defaults (127.0.0.1:7000, keep-alive on)
//! cargo run --bin mock_control_plane
//!
//! # Custom port, closing connections after each exchange
//! cargo run --bin mock_control_plane -- --port 9001 --no-keep-alive
//!
//! # Poll it with curl
//! curl -i http://127.0.0.1:7000/2018-06-01/runtime/invocation/next
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use clap::Parser;
use lambda_runtime_api::protocol::{
    ErrorResponse, GetInvocationError, ReportErrorError, ReportResultError,
};
use lambda_runtime_api::{ControlPlaneBehavior, MockControlPlane, ServerConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen host
    #[arg(long, env = "RUNTIME_API_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listen port (0 for ephemeral)
    #[arg(short, long, env = "RUNTIME_API_PORT", default_value = "7000")]
    port: u16,

    /// Close the connection after every exchange
    #[arg(long)]
    no_keep_alive: bool,

    /// Honor the reserved "timeout"/"disconnect" request ids
    #[arg(long)]
    failure_simulation: bool,

    /// Payload handed out on every next-invocation poll
    #[arg(long, default_value = "{\"hello\":\"world\"}")]
    payload: String,
}

/// Hands out sequentially numbered invocations with a fixed payload and
/// accepts every report, logging what it sees.
struct CannedBehavior {
    payload: Bytes,
    counter: AtomicU64,
}

impl ControlPlaneBehavior for CannedBehavior {
    fn get_invocation(&self) -> Result<(String, Bytes), GetInvocationError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok((format!("invocation-{n}"), self.payload.clone()))
    }

    fn process_response(
        &self,
        request_id: &str,
        payload: Option<&[u8]>,
    ) -> Result<(), ReportResultError> {
        info!(
            request_id = %request_id,
            payload_bytes = payload.map_or(0, <[u8]>::len),
            "result reported"
        );
        Ok(())
    }

    fn process_error(
        &self,
        request_id: &str,
        error: &ErrorResponse,
    ) -> Result<(), ReportErrorError> {
        info!(
            request_id = %request_id,
            error_type = %error.error_type,
            error_message = %error.error_message,
            "error reported"
        );
        Ok(())
    }

    fn process_init_error(&self, error: &ErrorResponse) -> Result<(), ReportErrorError> {
        info!(
            error_type = %error.error_type,
            error_message = %error.error_message,
            "initialization error reported"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        keep_alive: !args.no_keep_alive,
        failure_simulation: args.failure_simulation,
    };

    let behavior = Arc::new(CannedBehavior {
        payload: Bytes::from(args.payload),
        counter: AtomicU64::new(0),
    });

    let mut server = MockControlPlane::new(config, behavior);
    let addr = server.start().await?;
    info!(addr = %addr, "mock control plane running, Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
