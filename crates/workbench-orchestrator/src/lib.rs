// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workbench Orchestrator - Research Workspace Lifecycle Management
//!
//! This crate is the control plane for per-user research workspaces
//! (LXD containers and virtual machines running JupyterLab or MATLAB).
//! It owns the instance records, arbitrates host ports and per-user
//! quotas, and enqueues jobs for the external dispatcher that performs
//! the actual infrastructure work.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Portal Frontend                       │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │               workbench-orchestrator (This Crate)            │
//! │  ┌────────────┐  ┌───────────┐  ┌──────────┐  ┌───────────┐  │
//! │  │  Instance  │  │   Port /  │  │  Usage   │  │Reconciler │  │
//! │  │ Lifecycle  │  │   Quota   │  │ Sampler  │  │ (expiry)  │  │
//! │  └────────────┘  └───────────┘  └──────────┘  └───────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!        │                     │                       │
//!        │ records             │ jobs                  │ tokens
//!        ▼                     ▼                       ▼
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ PostgreSQL  │   │  Job Dispatcher  │   │   Token Issuer   │
//! │ (instances, │   │ (LXD workers,    │   │  (HMAC-SHA256)   │
//! │  jobs)      │   │  out-of-band)    │   │                  │
//! └─────────────┘   └──────────────────┘   └──────────────────┘
//! ```
//!
//! Every lifecycle operation follows the same shape: validate, write the
//! authoritative record through the registry, enqueue the matching job.
//! No operation waits for infrastructure; the dispatcher reports back by
//! writing `lxd_state` snapshots through the registry.
//!
//! # Instance Status State Machine
//!
//! ```text
//!   ┌─────────┐ create   ┌──────────┐ started  ┌─────────┐
//!   │ PENDING │─────────►│ STARTING │─────────►│ RUNNING │
//!   └────┬────┘          └────┬─────┘          └────┬────┘
//!        │                    │                     │ stop / expiry
//!        │                    │ error               ▼
//!        │                    ▼               ┌──────────┐
//!        │               ┌────────┐           │ STOPPING │
//!        │               │ FAILED │           └────┬─────┘
//!        │               └────────┘                │ stopped
//!        │                                         ▼
//!        │ delete                            ┌─────────┐  start
//!        │                                   │ STOPPED │─────► STARTING
//!        ▼                                   └────┬────┘
//!   ┌─────────┐                                   │ delete
//!   │ DELETED │◄──────────────────────────────────┘
//!   └─────────┘
//! ```
//!
//! DELETED is terminal and soft: the record stays for audit, but the
//! instance drops out of listings, quota sums and port reservation.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `WORKBENCH_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `WORKBENCH_TOKEN_KEY` | Yes | - | HMAC key for instance tokens |
//! | `WORKBENCH_PORT_MIN` | No | `30000` | Lowest assignable host port |
//! | `WORKBENCH_PORT_MAX` | No | `40000` | Exclusive host port upper bound |
//! | `WORKBENCH_PROJECT` | No | `workbench` | LXD project name |
//! | `WORKBENCH_POLL_INTERVAL_SECS` | No | `30` | Reconciler pass interval |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`config_store`]: Per-user quotas and the flavor catalog
//! - [`dispatch`]: Job dispatcher collaborator interface
//! - [`error`]: Error types for orchestrator operations
//! - [`lifespan`]: Lifespan budgets, expiry and extension rules
//! - [`model`]: Instance records and wire types
//! - [`orchestrator`]: The lifecycle operations themselves
//! - [`ports`]: Host-port candidate selection
//! - [`quota`]: Resource usage summation and ceiling checks
//! - [`reconciler`]: Background expiry and monitor-job enforcement
//! - [`registry`]: Instance record storage
//! - [`tokens`]: Access token minting
//! - [`units`]: Byte-size parsing and formatting
//! - [`usage`]: CPU/memory usage gauges from runtime snapshots

#![deny(missing_docs)]

/// Database migrations for workbench-orchestrator.
pub mod migrations;

/// Server configuration loaded from environment variables.
pub mod config;

/// Per-user quota ceilings and the flavor catalog.
pub mod config_store;

/// Job dispatcher collaborator interface.
pub mod dispatch;

/// Error types for orchestrator operations.
pub mod error;

/// Lifespan budgets, expiry and extension rules.
pub mod lifespan;

/// Instance records and wire types.
pub mod model;

/// Instance lifecycle operations.
pub mod orchestrator;

/// Host-port candidate selection.
pub mod ports;

/// Resource usage summation and quota ceiling checks.
pub mod quota;

/// Background worker enforcing expiry and monitor coverage.
pub mod reconciler;

/// Instance record storage.
pub mod registry;

/// Access token minting for provisioned instances.
pub mod tokens;

/// Byte-size parsing and formatting.
pub mod units;

/// CPU/memory usage gauges from runtime snapshots.
pub mod usage;

pub use config::Config;
pub use error::Error;
pub use orchestrator::InstanceOrchestrator;
