//! Company registration intake service — entry point.
//!
//! Accepts registration applications, prices them, and settles payments
//! collected through eSewa and Khalti. Customer emails are delivered by a
//! background dispatcher so that no request waits on a mail provider.

mod api;
mod config;
mod db;
mod errors;
mod fees;
mod gateway;
mod intake;
mod models;
mod notify;
mod payments;
mod store;

use std::sync::Arc;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use gateway::{EsewaGateway, KhaltiGateway};
use intake::IntakeService;
use notify::ChannelNotifier;
use payments::PaymentService;
use store::{MemoryStore, SharedStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(environment = ?config.environment, "Configuration loaded");

    let store: SharedStore = match &config.database_url {
        Some(url) => {
            info!("Using SQLite record store at {url}");
            Arc::new(db::SqliteStore::connect(url).await?)
        }
        None => {
            info!("DATABASE_URL not set; records are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // Shared by both gateways and the mailer; the timeout bounds every outbound call.
    let client = Client::builder().timeout(config.gateway_timeout).build()?;

    // ─── Notifications ────────────────────────────────────
    let (notifier, rx) = ChannelNotifier::new();
    let mailer = notify::mailer_from_config(client.clone(), &config.email);
    notify::spawn_dispatcher(rx, mailer, config.email.site_url.clone());
    let notifier = Arc::new(notifier);

    // ─── REST API ─────────────────────────────────────────
    let state = api::ApiState {
        intake: Arc::new(IntakeService::new(store.clone(), notifier.clone())),
        payments: Arc::new(PaymentService::new(
            store,
            notifier,
            EsewaGateway::new(client.clone(), config.esewa.clone()),
            KhaltiGateway::new(client, config.khalti.clone()),
        )),
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
