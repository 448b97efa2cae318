//! Structured observability hooks for the release lifecycle.
//!
//! This module provides:
//! - Release-scoped tracing spans via [`release_span`]
//! - Emission functions for lifecycle events: creation, start, queueing,
//!   dispatch, cache hits, status reports, completion, failure, gate warnings
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`). For JSON
//! output, start the daemon with `--json-logs`.

use tracing::{info, warn};

use berth_state::{ReleaseExtensionId, ReleaseId, State};

/// Release-scoped span. Attach it to async work with
/// [`tracing::Instrument::instrument`] so every event below carries
/// `release_id`.
pub fn release_span(release_id: &ReleaseId) -> tracing::Span {
    tracing::info_span!("berth.release", release_id = %release_id)
}

pub fn emit_release_created(release_id: &ReleaseId, head_hash: &str, is_rollback: bool) {
    info!(
        event = "release.created",
        release_id = %release_id,
        head_hash = %head_hash,
        is_rollback = is_rollback,
    );
}

/// Emit event: release started with this many workflow and deployment items.
pub fn emit_release_started(release_id: &ReleaseId, workflow: usize, deployment: usize) {
    info!(
        event = "release.started",
        release_id = %release_id,
        workflow_items = workflow,
        deployment_items = deployment,
    );
}

/// Emit event: a waiting release was promoted by the queue.
pub fn emit_release_queued(release_id: &ReleaseId, after: &ReleaseId) {
    info!(event = "release.queued", release_id = %release_id, after = %after);
}

pub fn emit_release_extension_dispatched(re_id: &ReleaseExtensionId, extension_key: &str) {
    info!(
        event = "release_extension.dispatched",
        release_extension_id = %re_id,
        extension_key = %extension_key,
    );
}

pub fn emit_release_extension_cached(re_id: &ReleaseExtensionId, cached_from: &ReleaseExtensionId) {
    info!(
        event = "release_extension.cached",
        release_extension_id = %re_id,
        cached_from = %cached_from,
    );
}

pub fn emit_release_extension_status(re_id: &ReleaseExtensionId, state: State, message: &str) {
    info!(
        event = "release_extension.status",
        release_extension_id = %re_id,
        state = %state,
        status_message = %message,
    );
}

/// Emit event: release reached its final state with duration.
pub fn emit_release_completed(release_id: &ReleaseId, state: State, duration_ms: u64) {
    info!(
        event = "release.completed",
        release_id = %release_id,
        state = %state,
        duration_ms = duration_ms,
    );
}

pub fn emit_release_failed(release_id: &ReleaseId, message: &str) {
    warn!(event = "release.failed", release_id = %release_id, reason = %message);
}

pub fn emit_gate_warning(release_id: &ReleaseId, complaint: &str) {
    warn!(event = "gate.warning", release_id = %release_id, complaint = %complaint);
}

/// Emit event: a handler returned an error; the event is dropped.
pub fn emit_handler_error(event_name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "handler.error", event_name = %event_name, error = %error);
}
