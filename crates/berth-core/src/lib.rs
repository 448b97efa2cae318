//! Berth Core Library
//!
//! The release orchestration engine: turns `release:create` and worker
//! status events into dispatched release extensions, cached reuse,
//! workflow to deployment transitions, completion, failure and queueing.

pub mod artifacts;
pub mod bus;
pub mod cache;
pub mod config;
mod error;
pub mod event;
pub mod gate;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod orchestrator;
pub mod payload;
pub mod routing;
pub mod signature;
pub mod telemetry;

mod aggregator;
mod completion;
mod dispatcher;
mod intake;
mod project_extension;
mod queue;
mod transition;

pub use artifacts::resolve_artifacts;
pub use bus::{EventBus, EventStream, InProcessBus, RecordingBus};
pub use cache::{cached_message, resolve_cache, CacheDecision};
pub use config::{GateConfig, OrchestratorConfig, ReleaseConfig, StoreConfig};
pub use error::{BerthError, Result};
pub use event::{
    Event, EventName, FeatureRef, GitRef, NotificationPayload, Payload, ProjectExtensionPayload,
    ProjectRef, ReleaseExtensionPayload, ReleasePayload, WebsocketMsg,
};
pub use gate::{evaluate_gate, GateVerdict};
pub use intake::{ReleaseRequest, RollbackRequest};
pub use metrics::METRICS;
pub use orchestrator::Orchestrator;
pub use payload::{build_release_payload, capture_snapshot, PayloadSource};
pub use routing::{Route, RoutingTable};
pub use signature::{secrets_signature, services_signature, snapshot_signatures};
pub use telemetry::init_tracing;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
