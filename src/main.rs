//! Application entry point for the `energyflow-pipeline` service.
//!
//! Startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Connect the PostgreSQL pool and create the schema if missing
//! - Mount the stage, run and health routes via the `routes` gateway (EMBP)
//! - Bind the Axum HTTP server and serve requests
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `LISTEN_ADDR` (optional) – bind address (default: `0.0.0.0:8080`)
//! - `PIPELINE_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `PIPELINE_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Stage settings (`SNAPSHOT_URL`, `ENDPOINT_URL`, `API_KEY`, ...) are read
//! here but only validated when a stage needs them, so the service starts
//! and reports health even when a stage is not yet configured.
use std::{env, net::SocketAddr};

use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{Context, Result};

mod config;
mod forecast;
mod models;
mod recommend;
mod routes;
mod runs;
mod schema;
mod snapshot;
mod stages;
mod store;
mod upstream;

use config::mask_db_url;
use stages::StageContext;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", mask_db_url(&cfg.db_url));

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .with_context(|| {
            format!("Failed to connect to database '{}'", mask_db_url(&cfg.db_url))
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid LISTEN_ADDR '{}'", cfg.listen_addr))?;

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(StageContext {
        pool,
        config: cfg,
        http,
    });

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output follows `FORCE_COLOR` (`1|true|yes` on, `0|false|no` off),
///   otherwise TTY detection
/// - `PIPELINE_SPAN_EVENTS`: `"full"` emits ENTER, EXIT and CLOSE with timing,
///   `"enter_exit"` emits ENTER and EXIT, anything else CLOSE only
/// - `RUST_LOG` wins when set; otherwise `PIPELINE_LOG_LEVEL` picks the level
///
/// Call once at startup, before any tracing macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("PIPELINE_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("PIPELINE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,hyper=info,reqwest=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
