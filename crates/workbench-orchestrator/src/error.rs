// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for workbench-orchestrator.

use thiserror::Error;

/// Resource dimension that exceeded its quota ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Aggregate CPU cores across the user's live instances.
    Cpu,
    /// Aggregate memory across the user's live instances.
    Memory,
    /// Aggregate disk across the user's live instances.
    Disk,
    /// Number of live instances.
    InstanceCount,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Cpu => "CPU",
            ResourceKind::Memory => "MEMORY",
            ResourceKind::Disk => "DISK",
            ResourceKind::InstanceCount => "COUNT",
        };
        f.write_str(s)
    }
}

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Instance, user, or configuration entry was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requester is neither the owner nor an admin.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A per-user quota ceiling would be exceeded.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(ResourceKind),

    /// Request validation failed (bad memory string, missing identifiers).
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Host port is already reserved by a live instance.
    ///
    /// Internal to port allocation; `create_instance` retries with the next
    /// candidate before surfacing anything to the caller.
    #[error("Host port {0} already reserved")]
    PortConflict(u16),

    /// Lifespan extension refused: the instance already has enough runway.
    #[error("Instance already has {0}ms of runway remaining")]
    EnoughRunway(i64),

    /// A registry update affected no record even though existence was verified.
    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Result type using orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;
