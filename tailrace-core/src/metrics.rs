// Copyright 2025 Tailrace Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Metrics instrumentation for the replication engine.
//!
//! Uses the `metrics` facade crate, so any exporter (Prometheus, StatsD,
//! ...) installed by the host application picks these up. All series follow
//! Prometheus naming conventions, prefixed with `tailrace_`, counters
//! suffixed `_total`.
//!
//! Labels are kept low-cardinality: `target` (configured target names) and
//! `operation` (insert/update/replace/delete). Never label with document
//! ids or error messages.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Total change events received from the feed.
const EVENTS_SEEN_TOTAL: &str = "tailrace_events_seen_total";

/// Total events whose fan-out settled (regardless of per-target outcomes).
const EVENTS_SYNCED_TOTAL: &str = "tailrace_events_synced_total";

/// Total events dropped by the configured filter predicate.
const EVENTS_FILTERED_TOTAL: &str = "tailrace_events_filtered_total";

/// Total successful applies, per target and operation.
const TARGET_APPLIED_TOTAL: &str = "tailrace_target_applied_total";

/// Total apply errors, per target.
const TARGET_APPLY_ERRORS_TOTAL: &str = "tailrace_target_apply_errors_total";

/// Total checkpoint writes that succeeded.
const CHECKPOINT_SAVES_TOTAL: &str = "tailrace_checkpoint_saves_total";

/// Total checkpoint writes that failed (swallowed, logged).
const CHECKPOINT_SAVE_FAILURES_TOTAL: &str = "tailrace_checkpoint_save_failures_total";

/// Total feed reconnect attempts.
const FEED_RECONNECTS_TOTAL: &str = "tailrace_feed_reconnects_total";

/// Engine status: 0=stopped, 1=running, 2=reconnecting.
const ENGINE_STATUS: &str = "tailrace_engine_status";

/// Number of connected targets.
const CONNECTED_TARGETS: &str = "tailrace_connected_targets";

/// Time taken by one target apply call.
const APPLY_DURATION_SECONDS: &str = "tailrace_apply_duration_seconds";

/// Engine status gauge values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The engine is stopped
    Stopped,
    /// The engine is consuming the feed
    Running,
    /// The engine is reconnecting after a feed disruption
    Reconnecting,
}

impl EngineStatus {
    fn as_gauge(self) -> f64 {
        match self {
            EngineStatus::Stopped => 0.0,
            EngineStatus::Running => 1.0,
            EngineStatus::Reconnecting => 2.0,
        }
    }
}

/// Registers descriptions for all engine metrics.
///
/// Call once at application startup, before the engine runs; purely
/// informational for exporters that surface help text.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_SEEN_TOTAL,
        "Total change events received from the feed"
    );
    describe_counter!(
        EVENTS_SYNCED_TOTAL,
        "Total events whose target fan-out settled"
    );
    describe_counter!(
        EVENTS_FILTERED_TOTAL,
        "Total events dropped by the configured filter predicate"
    );
    describe_counter!(
        TARGET_APPLIED_TOTAL,
        "Total events successfully applied, per target and operation"
    );
    describe_counter!(
        TARGET_APPLY_ERRORS_TOTAL,
        "Total apply errors, per target"
    );
    describe_counter!(
        CHECKPOINT_SAVES_TOTAL,
        "Total checkpoint writes that succeeded"
    );
    describe_counter!(
        CHECKPOINT_SAVE_FAILURES_TOTAL,
        "Total checkpoint writes that failed and were swallowed"
    );
    describe_counter!(FEED_RECONNECTS_TOTAL, "Total feed reconnect attempts");

    describe_gauge!(
        ENGINE_STATUS,
        "Engine status: 0=stopped, 1=running, 2=reconnecting"
    );
    describe_gauge!(CONNECTED_TARGETS, "Number of connected targets");

    describe_histogram!(
        APPLY_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken by one target apply call"
    );
}

/// Records one event received from the feed.
pub fn increment_events_seen(operation: &str) {
    counter!(EVENTS_SEEN_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Records one event whose fan-out settled.
pub fn increment_events_synced() {
    counter!(EVENTS_SYNCED_TOTAL).increment(1);
}

/// Records one event dropped by the filter predicate.
pub fn increment_events_filtered() {
    counter!(EVENTS_FILTERED_TOTAL).increment(1);
}

/// Records one successful apply on a target.
pub fn increment_target_applied(target: &str, operation: &str) {
    counter!(
        TARGET_APPLIED_TOTAL,
        "target" => target.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Records one apply error on a target.
pub fn increment_target_apply_errors(target: &str) {
    counter!(TARGET_APPLY_ERRORS_TOTAL, "target" => target.to_string()).increment(1);
}

/// Records one successful checkpoint write.
pub fn increment_checkpoint_saves() {
    counter!(CHECKPOINT_SAVES_TOTAL).increment(1);
}

/// Records one swallowed checkpoint write failure.
pub fn increment_checkpoint_save_failures() {
    counter!(CHECKPOINT_SAVE_FAILURES_TOTAL).increment(1);
}

/// Records one feed reconnect attempt.
pub fn increment_feed_reconnects() {
    counter!(FEED_RECONNECTS_TOTAL).increment(1);
}

/// Publishes the engine status.
pub fn set_engine_status(status: EngineStatus) {
    gauge!(ENGINE_STATUS).set(status.as_gauge());
}

/// Publishes the number of connected targets.
pub fn set_connected_targets(count: usize) {
    gauge!(CONNECTED_TARGETS).set(count as f64);
}

/// Records the duration of one target apply call.
pub fn record_apply_duration(seconds: f64, target: &str) {
    histogram!(APPLY_DURATION_SECONDS, "target" => target.to_string()).record(seconds);
}
