//! Event bus seam.
//!
//! The orchestrator only ever publishes; consumption is the caller's job
//! (the daemon drains an [`EventStream`], tests drain a [`RecordingBus`]).

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{BerthError, Result};
use crate::event::{Event, EventName};

/// At-least-once publish side of the event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Unbounded in-process bus. Every published event is delivered once to the
/// paired [`EventStream`].
#[derive(Debug, Clone)]
pub struct InProcessBus {
    tx: mpsc::UnboundedSender<Event>,
}

/// Receiving half of an [`InProcessBus`].
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl InProcessBus {
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventStream { rx })
    }
}

impl EventStream {
    /// Next event, or `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!(event = %event.name, state = %event.state, "publishing");
        self.tx
            .send(event)
            .map_err(|e| BerthError::Bus(format!("event stream closed: {}", e.0.name)))
    }
}

// ---------------------------------------------------------------------------
// Recording bus (tests)
// ---------------------------------------------------------------------------

/// Bus that keeps every published event in memory.
#[derive(Debug, Default)]
pub struct RecordingBus {
    events: Mutex<Vec<Event>>,
    rejected: Mutex<Vec<EventName>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Take and clear everything published so far.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Published events named `name`.
    pub fn named(&self, name: &EventName) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.name == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Fail every later publish of `name`, as a broker outage would.
    pub fn reject(&self, name: EventName) {
        self.rejected.lock().unwrap().push(name);
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.rejected.lock().unwrap().contains(&event.name) {
            return Err(BerthError::Bus(format!("{} rejected", event.name)));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
