use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::deps::Timeouts;

/// Connector configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Base URL of the discovery collaborator (`POST {url}/discover`)
    pub discovery_service_url: String,
    /// Base URL of the import collaborator (`POST {url}/import`)
    pub import_service_url: String,
    pub discovery_timeout_secs: u64,
    pub import_timeout_secs: u64,
    pub store_timeout_secs: u64,
    /// Six-field cron expression for the due-sync driver
    pub sync_cron: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            discovery_service_url: env::var("DISCOVERY_SERVICE_URL")
                .context("DISCOVERY_SERVICE_URL must be set")?,
            import_service_url: env::var("IMPORT_SERVICE_URL")
                .context("IMPORT_SERVICE_URL must be set")?,
            discovery_timeout_secs: secs_var("DISCOVERY_TIMEOUT_SECS", 30)?,
            import_timeout_secs: secs_var("IMPORT_TIMEOUT_SECS", 600)?,
            store_timeout_secs: secs_var("STORE_TIMEOUT_SECS", 10)?,
            sync_cron: env::var("SYNC_CRON").unwrap_or_else(|_| "0 * * * * *".to_string()),
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            discovery: Duration::from_secs(self.discovery_timeout_secs),
            import: Duration::from_secs(self.import_timeout_secs),
            store: Duration::from_secs(self.store_timeout_secs),
        }
    }
}

fn secs_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a whole number of seconds", name)),
        Err(_) => Ok(default),
    }
}
