//! Demo service.
//!
//! Serves a small web plane and an `echo.v1.Echo` RPC service with an HTTP
//! gateway, all on one port. Send SIGUSR2 (or SIGHUP) to upgrade in place,
//! SIGTERM to drain and exit.
//!
//! ```text
//!  GET  /                  → plain-text greeting        (web plane)
//!  GET  /stream?count=N    → N chunks, 100ms apart       (web plane)
//!  GET  /health            → JSON health report          (web plane)
//!  GET  /v1/echo/{message} → gateway → echo.v1.Echo/Say  (web plane)
//!  POST /echo.v1.Echo/Say  → JSON echo                   (RPC plane, h2)
//! ```

use std::convert::Infallible;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};

use servicekit::config::{finalize, read_config};
use servicekit::observability::logging::init_logging;
use servicekit::{gateway, HandlerFault, LocalRpc, Service, ServiceConfig, ServiceDescriptor};

const ECHO_SERVICE: &str = "echo.v1.Echo";

#[derive(Debug, Parser)]
#[command(name = "servicekit", about = "Dual-protocol service with live upgrades")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file.
    #[arg(short, long)]
    address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EchoRequest {
    message: String,
}

#[derive(Debug, Serialize)]
struct EchoReply {
    message: String,
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    count: Option<u32>,
}

async fn say(Json(request): Json<EchoRequest>) -> Result<Json<EchoReply>, HandlerFault> {
    if request.message.is_empty() {
        return Err(HandlerFault::validation("message must not be empty"));
    }
    Ok(Json(EchoReply {
        message: request.message,
        pid: std::process::id(),
    }))
}

async fn stream(Query(params): Query<StreamParams>) -> Body {
    let count = params.count.unwrap_or(20);
    let chunks = futures_util::stream::unfold(0u32, move |sent| async move {
        if sent >= count {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let chunk = Bytes::from(format!("chunk {} from pid {}\n", sent, std::process::id()));
        Some((Ok::<_, Infallible>(chunk), sent + 1))
    });
    Body::from_stream(chunks)
}

fn echo_gateway(router: Router, rpc: LocalRpc) -> Router {
    router.route(
        "/v1/echo/{message}",
        get(move |Path(message): Path<String>| {
            let rpc = rpc.clone();
            async move {
                rpc.invoke_json(ECHO_SERVICE, "Say", &EchoRequest { message })
                    .await
            }
        }),
    )
}

fn load(args: &Args) -> servicekit::Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(address) = &args.address {
        config.http.address = address.clone();
    }
    Ok(finalize(config, |key| std::env::var(key).ok())?)
}

async fn run(config: ServiceConfig) -> servicekit::Result<()> {
    let mut service = Service::new(config).await?;
    let name = service.config().service.name.clone();

    let server = service.server_mut();
    server.register_rpc(
        ServiceDescriptor::new(ECHO_SERVICE).method("Say"),
        post(say),
        gateway(echo_gateway),
    )?;
    server.route_web(|router| {
        router
            .route(
                "/",
                get(move || {
                    let name = name.clone();
                    async move { format!("hello from {} (pid {})\n", name, std::process::id()) }
                }),
            )
            .route("/stream", get(stream))
    });

    service.serve().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load(&args) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.observability.log_level);

    tracing::info!(
        service = %config.service.name,
        address = %config.http.address,
        pid = std::process::id(),
        "servicekit starting"
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
