// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for workbench-orchestrator.

use std::time::Duration;

use crate::ports::PortRange;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for the instance and job tables.
    pub database_url: String,
    /// Host port range handed out to instances.
    pub port_range: PortRange,
    /// LXD project all instances are created under.
    pub project: String,
    /// Shared secret for signing instance access tokens.
    pub token_key: String,
    /// How often the reconciler runs a pass.
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WORKBENCH_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("WORKBENCH_DATABASE_URL"))?;

        let min: u16 = std::env::var("WORKBENCH_PORT_MIN")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        let max: u16 = std::env::var("WORKBENCH_PORT_MAX")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        // Zeroed bounds fall back to the 30000..40000 default.
        let port_range = PortRange { min, max }.normalized();
        if port_range.span() == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let project =
            std::env::var("WORKBENCH_PROJECT").unwrap_or_else(|_| "workbench".to_string());

        let token_key = std::env::var("WORKBENCH_TOKEN_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("WORKBENCH_TOKEN_KEY"))?;

        let poll_interval_secs: u64 = std::env::var("WORKBENCH_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPollInterval)?;

        Ok(Self {
            database_url,
            port_range,
            project,
            token_key,
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port range is invalid or empty.
    #[error("Invalid port range")]
    InvalidPort,
    /// The reconciler poll interval is not a number of seconds.
    #[error("Invalid poll interval")]
    InvalidPollInterval,
}
