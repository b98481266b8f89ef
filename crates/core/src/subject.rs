use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, ParentLink, ResourceIdentity, Result};

pub const TYPE_READY: &str = "Ready";
pub const TYPE_SYNCED: &str = "Synced";

/// How to reach the endpoint a subject targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum EndpointDescriptor {
    /// Ambient credentials: in-cluster service account or the local kube config.
    InjectedIdentity,
    /// A kubeconfig file on disk, optionally pinned to one context.
    KubeconfigFile { path: String, context: Option<String> },
    /// A kubeconfig document carried inline.
    KubeconfigInline { document: String, context: Option<String> },
    /// An endpoint registered with the resolver under a name.
    Named { name: String },
}

impl Default for EndpointDescriptor {
    fn default() -> Self {
        EndpointDescriptor::InjectedIdentity
    }
}

/// Readiness selection as written by users. Converted into [`ReadinessPolicy`] per cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Ready as soon as the apply succeeded.
    SuccessfulCreate,
    /// Ready follows the observed object's own `Ready` condition.
    DeriveFromObject,
    /// Ready follows a boolean expression over the observed object.
    UseExpression(String),
}

impl Readiness {
    pub fn policy(&self) -> Result<ReadinessPolicy> {
        match self.policy.as_deref().map(str::trim) {
            None | Some("") | Some("SuccessfulCreate") => Ok(ReadinessPolicy::SuccessfulCreate),
            Some("DeriveFromObject") => Ok(ReadinessPolicy::DeriveFromObject),
            Some("UseExpression") | Some("UseCELExpression") => match self.expression.as_deref().map(str::trim) {
                Some(expr) if !expr.is_empty() => Ok(ReadinessPolicy::UseExpression(expr.to_string())),
                _ => Err(Error::Policy("readiness policy UseExpression requires an expression".into())),
            },
            Some(other) => Err(Error::Policy(format!("unknown readiness policy {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSpec {
    #[serde(default)]
    pub endpoint: EndpointDescriptor,
    /// Desired object, a complete manifest with apiVersion, kind and metadata.name.
    pub manifest: serde_json::Value,
    #[serde(default)]
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(type_: &str, status: ConditionStatus, reason: &str) -> Self {
        Self { type_: type_.to_string(), status, reason: reason.to_string(), message: None, last_transition_time: Utc::now() }
    }

    pub fn available() -> Self {
        Self::new(TYPE_READY, ConditionStatus::True, "Available")
    }

    pub fn unavailable() -> Self {
        Self::new(TYPE_READY, ConditionStatus::False, "Unavailable")
    }

    pub fn reconcile_success() -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::True, "ReconcileSuccess")
    }

    pub fn reconcile_error(err: &Error) -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::False, "ReconcileError").with_message(err.to_string())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Equal in everything but the transition time.
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_ && self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStatus {
    #[serde(default)]
    pub conditions: SmallVec<[Condition; 2]>,
    #[serde(default)]
    pub observed_generation: i64,
    /// Last observed remote manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_provider: Option<serde_json::Value>,
}

impl SubjectStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Replace the condition of the same type; the transition time only moves when the status flips.
    pub fn set_condition(&mut self, mut cond: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time;
                }
                *existing = cond;
            }
            None => self.conditions.push(cond),
        }
    }
}

/// The declarative resource being reconciled. Only `status` is written by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSubject {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub generation: i64,
    /// Set once the owner asked for removal.
    #[serde(default)]
    pub deleting: bool,
    pub spec: SubjectSpec,
    #[serde(default)]
    pub status: SubjectStatus,
}

/// Desired object derived from a subject's manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Desired {
    pub identity: ResourceIdentity,
    pub object: serde_json::Value,
}

impl ReconcileSubject {
    pub fn desired(&self) -> Result<Desired> {
        if !self.spec.manifest.is_object() {
            return Err(Error::Configuration(format!("subject {}: manifest is not an object", self.name)));
        }
        let identity = ResourceIdentity::of_object(&self.spec.manifest)
            .map_err(|e| e.context(&format!("subject {}", self.name)))?;
        Ok(Desired { identity, object: self.spec.manifest.clone() })
    }

    pub fn parent_link(&self) -> ParentLink {
        ParentLink { name: self.name.clone(), namespace: self.namespace.clone() }
    }
}
