// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging and metrics infrastructure.
//!
//! - **Tracing**: structured logging via `tracing`, initialised once per process
//! - **Metrics**: named counters and timings for lease and session health
//!
//! ```rust,ignore
//! use agentdesk::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Public async operations carry `#[instrument]`; non-fatal failures are logged
//! at `warn` and counted via [`metrics::count`].

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig};
pub use metrics::{Metrics, MetricsSnapshot, OperationMetrics, TimedOperation, GLOBAL_METRICS};
