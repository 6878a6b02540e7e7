//! Application configuration loaded from environment variables.

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Maximum gap between expected and received amount that still confirms
    /// an order (absorbs bank rounding and transfer fees)
    pub amount_tolerance: i64,
    /// Email of the bootstrap administrator account
    pub admin_email: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settlement.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid API_PORT".to_string()))?,
            amount_tolerance: env_var("AMOUNT_TOLERANCE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid AMOUNT_TOLERANCE".to_string()))?,
            admin_email: env_var("ADMIN_EMAIL")
                .unwrap_or_else(|_| "admin@localhost".to_string()),
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}
