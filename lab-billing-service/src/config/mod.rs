//! Configuration module for lab-billing-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

use crate::services::{LedgerSettings, DEFAULT_ALLOCATION_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct LabBillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Attempts at allocating a record or invoice number before giving up.
    pub number_allocation_attempts: u32,
}

impl LedgerConfig {
    pub fn settings(&self) -> LedgerSettings {
        LedgerSettings {
            number_allocation_attempts: self.number_allocation_attempts,
        }
    }
}

impl LabBillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "lab-billing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            ledger: LedgerConfig {
                number_allocation_attempts: env::var("NUMBER_ALLOCATION_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_ALLOCATION_ATTEMPTS),
            },
        })
    }
}
