//! Storefront settlement service — entry point.
//!
//! Receives bank-transfer notifications on a webhook, matches them to
//! pending orders, allocates activation credentials from per-product
//! inventory pools, and settles multi-level referral commissions.  The
//! surrounding CRUD (catalog, inventory administration, referral links,
//! commission settings) is exposed as a small Axum REST API over SQLite.

mod api;
mod commission;
mod config;
mod db;
mod errors;
mod inventory;
mod models;
mod referral;
mod webhook;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // Make sure role-gated endpoints are reachable on a fresh install.
    db::ensure_admin(&pool, &config.admin_email).await?;

    let state = Arc::new(api::ApiState {
        pool,
        config: config.clone(),
    });
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
