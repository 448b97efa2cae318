//! Bus event envelope and typed payloads.
//!
//! Event names follow the `<noun>:<verb-or-wildcard>` convention on the wire
//! (`release:create`, `release:dockerbuilder:status`, ...). Internally they
//! are the closed [`EventName`] enum; extension keys may themselves contain
//! colons (`kubernetes:deployment`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use berth_state::{
    Action, Artifact, ProjectExtensionId, ReleaseExtensionId, ReleaseId, SecretSnapshot,
    ServiceSnapshot, State, REDACTED,
};

use crate::error::{BerthError, Result};

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventName {
    /// `release:create`
    ReleaseCreate,
    /// `release:<key>`, addressed to an extension worker.
    Release(String),
    /// `release:<key>:status`, reported back by an extension worker.
    ReleaseStatus(String),
    /// `project:<key>`
    Project(String),
    /// `project:<key>:status`
    ProjectStatus(String),
    /// `websocket`
    Websocket,
}

impl EventName {
    pub fn release(key: impl Into<String>) -> Self {
        EventName::Release(key.into())
    }

    pub fn release_status(key: impl Into<String>) -> Self {
        EventName::ReleaseStatus(key.into())
    }

    pub fn project_status(key: impl Into<String>) -> Self {
        EventName::ProjectStatus(key.into())
    }

    /// The extension key addressed by the event, if any.
    pub fn extension_key(&self) -> Option<&str> {
        match self {
            EventName::Release(k)
            | EventName::ReleaseStatus(k)
            | EventName::Project(k)
            | EventName::ProjectStatus(k) => Some(k),
            EventName::ReleaseCreate | EventName::Websocket => None,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventName::ReleaseCreate => f.write_str("release:create"),
            EventName::Release(k) => write!(f, "release:{k}"),
            EventName::ReleaseStatus(k) => write!(f, "release:{k}:status"),
            EventName::Project(k) => write!(f, "project:{k}"),
            EventName::ProjectStatus(k) => write!(f, "project:{k}:status"),
            EventName::Websocket => f.write_str("websocket"),
        }
    }
}

impl FromStr for EventName {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BerthError::InvalidEventName(s.to_string());
        if s == "websocket" {
            return Ok(EventName::Websocket);
        }
        if s == "release:create" {
            return Ok(EventName::ReleaseCreate);
        }
        let (noun, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (key, status) = match rest.strip_suffix(":status") {
            Some(key) => (key, true),
            None => (rest, false),
        };
        if key.is_empty() {
            return Err(invalid());
        }
        let key = key.to_string();
        match (noun, status) {
            ("release", false) => Ok(EventName::Release(key)),
            ("release", true) => Ok(EventName::ReleaseStatus(key)),
            ("project", false) => Ok(EventName::Project(key)),
            ("project", true) => Ok(EventName::ProjectStatus(key)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for EventName {
    type Error = BerthError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub id: String,
    pub slug: String,
    pub repository: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    #[serde(rename = "gitUrl")]
    pub url: String,
    pub protocol: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub head_hash: String,
    pub rsa_private_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRef {
    pub id: String,
    pub hash: String,
    pub parent_hash: String,
    pub user: String,
    pub message: String,
    pub created: DateTime<Utc>,
}

/// Everything a worker needs to act on a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePayload {
    pub id: ReleaseId,
    pub project: ProjectRef,
    pub git: GitRef,
    pub head_feature: FeatureRef,
    pub tail_feature: FeatureRef,
    /// Email of the requesting user.
    pub user: String,
    pub services: Vec<ServiceSnapshot>,
    pub secrets: Vec<SecretSnapshot>,
    /// Environment key.
    pub environment: String,
    pub is_rollback: bool,
}

impl ReleasePayload {
    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for secret in &mut copy.secrets {
            secret.value = REDACTED.to_string();
        }
        if !copy.git.rsa_private_key.is_empty() {
            copy.git.rsa_private_key = REDACTED.to_string();
        }
        copy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseExtensionPayload {
    pub id: ReleaseExtensionId,
    pub project: ProjectRef,
    pub release: ReleasePayload,
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectExtensionPayload {
    pub id: ProjectExtensionId,
    pub project: ProjectRef,
    pub environment: String,
}

/// Release outcome addressed to one notification extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: ProjectExtensionId,
    pub project: ProjectRef,
    pub release: ReleasePayload,
    pub environment: String,
}

/// Message relayed to UI clients: `{event: <channel>, payload: <entity>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMsg {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Release(ReleasePayload),
    ReleaseExtension(ReleaseExtensionPayload),
    ProjectExtension(ProjectExtensionPayload),
    Notification(NotificationPayload),
    Websocket(WebsocketMsg),
}

impl Payload {
    pub fn model(&self) -> &'static str {
        match self {
            Payload::Release(_) => "release",
            Payload::ReleaseExtension(_) => "release_extension",
            Payload::ProjectExtension(_) => "project_extension",
            Payload::Notification(_) => "notification",
            Payload::Websocket(_) => "websocket",
        }
    }

    fn redacted(&self) -> Self {
        match self {
            Payload::Release(r) => Payload::Release(r.redacted()),
            Payload::ReleaseExtension(re) => Payload::ReleaseExtension(ReleaseExtensionPayload {
                release: re.release.redacted(),
                ..re.clone()
            }),
            Payload::Notification(n) => Payload::Notification(NotificationPayload {
                release: n.release.redacted(),
                ..n.clone()
            }),
            other => other.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub name: EventName,
    pub action: Action,
    pub state: State,
    #[serde(default)]
    pub state_message: String,
    pub payload: Payload,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: EventName, action: Action, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            name,
            action,
            state: State::Waiting,
            state_message: String::new(),
            payload,
            artifacts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// A `websocket` status event relayed on `channel`.
    pub fn websocket(channel: impl Into<String>, entity: serde_json::Value) -> Self {
        let channel = channel.into();
        let mut event = Event::new(
            EventName::Websocket,
            Action::Status,
            Payload::Websocket(WebsocketMsg {
                event: channel.clone(),
                payload: entity,
            }),
        );
        event.add_artifact("event", channel, false);
        event
    }

    pub fn with_state(mut self, state: State, message: impl Into<String>) -> Self {
        self.state = state;
        self.state_message = message.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_parent(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id);
        self
    }

    pub fn add_artifact(&mut self, key: impl Into<String>, value: impl Into<String>, secret: bool) {
        let value = serde_json::Value::String(value.into());
        let artifact = if secret {
            Artifact::secret(key, value)
        } else {
            Artifact::new(key, value)
        };
        self.artifacts.push(artifact);
    }

    /// First artifact with `key`.
    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.key == key)
    }

    /// Copy safe for logs and unprivileged readers: secret artifacts, release
    /// secrets and private keys are masked.
    pub fn redacted(&self) -> Self {
        Self {
            artifacts: self.artifacts.iter().map(Artifact::redacted).collect(),
            payload: self.payload.redacted(),
            ..self.clone()
        }
    }

    pub fn release_payload(&self) -> Result<&ReleasePayload> {
        match &self.payload {
            Payload::Release(r) => Ok(r),
            _ => Err(self.unexpected("release")),
        }
    }

    pub fn release_extension_payload(&self) -> Result<&ReleaseExtensionPayload> {
        match &self.payload {
            Payload::ReleaseExtension(re) => Ok(re),
            _ => Err(self.unexpected("release_extension")),
        }
    }

    pub fn project_extension_payload(&self) -> Result<&ProjectExtensionPayload> {
        match &self.payload {
            Payload::ProjectExtension(pe) => Ok(pe),
            _ => Err(self.unexpected("project_extension")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> BerthError {
        BerthError::UnexpectedPayload {
            event: self.name.to_string(),
            expected,
        }
    }
}
