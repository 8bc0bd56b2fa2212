//! Parry HTTP server
//!
//! Runs the lifecycle engine with a health check endpoint and, optionally, a
//! catch-all proxy to one downstream service.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ net::admission ──▶ net::connection (ConnectionSession)
//!                  (accept)         (ceiling / 503)     │  http::decoder
//!                                                       │  http::request (RequestContext)
//!                                                       │  resilience::timeouts
//!                                                       ▼
//!                                               endpoint::* (filters, validator, execute)
//!                                                       │        └─▶ endpoint::proxy ──▶ downstream
//!                                                       ▼
//!     Client ◀───────────────────────────── http::response (ResponseFinalizer)
//!
//!     Cross-cutting: config, lifecycle (hooks, shutdown), observability (events, logs, metrics)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http::Method;
use url::Url;

use parry_server::config::{load_config, ServerConfig};
use parry_server::endpoint::{endpoint_fn, DownstreamRouter, EndpointDescriptor, ProxyEndpoint};
use parry_server::http::{HttpServer, ResponseInfo};
use parry_server::lifecycle::{signals::shutdown_signal, startup::build_runtime, Shutdown};
use parry_server::observability::{logging::init_logging, metrics::init_metrics};

#[derive(Debug, Parser)]
#[command(name = "parry-server", version, about = "Non-blocking HTTP server")]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forward every request not handled locally to this base URL.
    #[arg(long, value_name = "URL")]
    proxy_to: Option<Url>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        port = config.effective_port(),
        max_connections = config.listener.max_open_incoming_connections,
        "parry-server starting"
    );

    let runtime = build_runtime(&config.threads)?;
    runtime.block_on(run(config, cli.proxy_to))
}

async fn run(config: ServerConfig, proxy_to: Option<Url>) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let router = DownstreamRouter::from_config(&config.timeouts);
    let mut builder = HttpServer::builder(config).endpoint(endpoint_fn(
        EndpointDescriptor::exact("healthcheck", "/healthcheck").method(Method::GET),
        |_req, _ctx| async { Ok(ResponseInfo::ok("OK").with_content_type("text/plain")) },
    ));
    if let Some(base) = proxy_to {
        tracing::info!(downstream = %base, "Proxying unmatched requests");
        builder = builder.endpoint(Arc::new(ProxyEndpoint::new(
            EndpointDescriptor::prefix("proxy", "/"),
            base,
            router,
        )?));
    }
    let server = builder.build()?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.trigger();
    });

    server.serve(server_shutdown).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
