//! Tether core types: endpoint/resource identities, cache keys, the reconciled
//! subject document and the shared error taxonomy.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
mod subject;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result, SchemaErrorKind};
pub use subject::{
    Condition, ConditionStatus, Desired, EndpointDescriptor, ReadinessPolicy, Readiness, ReconcileSubject,
    SubjectSpec, SubjectStatus, TYPE_READY, TYPE_SYNCED,
};

pub mod prelude {
    pub use super::{CacheKey, Delta, DeltaKind, EndpointIdentity, Error, Gvk, ParentLink, ResourceIdentity, Result};
}

/// Group/version/kind of a resource served by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(Error::schema(
                SchemaErrorKind::KindUnrecognized,
                format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key),
            )),
        }
    }

    /// Build from the `apiVersion` and `kind` fields of a manifest.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Result<Self> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        if version.is_empty() || version.contains('/') || kind.is_empty() {
            return Err(Error::schema(
                SchemaErrorKind::KindUnrecognized,
                format!("cannot resolve kind from apiVersion {:?} and kind {:?}", api_version, kind),
            ));
        }
        Ok(Self::new(group, version, kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Identifies a target endpoint independent of the credentials used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub host_url: String,
    pub api_path: String,
}

impl EndpointIdentity {
    /// `scheme://authority` plus the API root path. A trailing slash is trimmed and an
    /// empty path becomes `/`, so equivalent server URLs map to the same identity.
    pub fn from_parts(scheme: &str, authority: &str, path: &str) -> Self {
        let trimmed = path.trim_end_matches('/');
        let api_path = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
        Self { host_url: format!("{}://{}", scheme.to_ascii_lowercase(), authority.to_ascii_lowercase()), api_path }
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_path == "/" {
            f.write_str(&self.host_url)
        } else {
            write!(f, "{}{}", self.host_url, self.api_path)
        }
    }
}

/// One object within one endpoint. An empty namespace means "unset".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.unwrap_or("").to_string(), name: name.to_string() }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }

    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self { gvk: self.gvk.clone(), namespace: namespace.to_string(), name: self.name.clone() }
    }

    /// Reads `apiVersion`, `kind`, `metadata.name` and `metadata.namespace` from an object.
    pub fn of_object(obj: &serde_json::Value) -> Result<Self> {
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Configuration("manifest missing apiVersion".into()))?;
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Configuration("manifest missing kind".into()))?;
        let meta = obj.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration("manifest missing metadata.name".into()))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
        Ok(Self::new(Gvk::from_type_meta(api_version, kind)?, namespace, name))
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// Key of one watch session in the cache registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub endpoint: EndpointIdentity,
    pub resource: ResourceIdentity,
}

impl CacheKey {
    pub fn new(endpoint: EndpointIdentity, resource: ResourceIdentity) -> Self {
        Self { endpoint, resource }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.resource, self.endpoint)
    }
}

/// The subject to re-reconcile when a watched object changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParentLink {
    pub name: String,
    pub namespace: Option<String>,
}

impl fmt::Display for ParentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Raw object (possibly stripped of managed fields under feature flags)
    pub raw: serde_json::Value,
}

/// Strip server bookkeeping that never matters for comparisons or status.
#[cfg(feature = "strip-managed-fields")]
pub fn normalize(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[cfg(not(feature = "strip-managed-fields"))]
pub fn normalize(_v: &mut serde_json::Value) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_key_roundtrips_core_and_grouped() {
        let core = Gvk::parse_key("v1/ConfigMap").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.key(), "v1/ConfigMap");
        let apps = Gvk::parse_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.api_version(), "apps/v1");
        assert!(Gvk::parse_key("a/b/c/d").is_err());
        assert!(Gvk::parse_key("").is_err());
    }

    #[test]
    fn malformed_api_version_is_a_schema_error() {
        let err = Gvk::from_type_meta("a/b/c", "Widget").unwrap_err();
        assert!(matches!(err, Error::Schema { kind: SchemaErrorKind::KindUnrecognized, .. }), "{err}");
        assert!(Gvk::from_type_meta("v1", "").is_err());
    }

    #[test]
    fn endpoint_identity_normalizes_trailing_slash() {
        let a = EndpointIdentity::from_parts("https", "Cluster.example:6443", "/");
        let b = EndpointIdentity::from_parts("https", "cluster.example:6443", "");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://cluster.example:6443");
        let c = EndpointIdentity::from_parts("https", "proxy", "/k8s/clusters/c1/");
        assert_eq!(c.api_path, "/k8s/clusters/c1");
    }

    #[test]
    fn identity_of_object_reads_type_and_metadata() {
        let obj = json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "namespace": "ns" }
        });
        let id = ResourceIdentity::of_object(&obj).unwrap();
        assert_eq!(id.gvk, Gvk::new("example.io", "v1", "Widget"));
        assert_eq!(id.namespace(), Some("ns"));
        assert_eq!(id.to_string(), "example.io/v1/Widget ns/w1");

        let missing = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} });
        let e = ResourceIdentity::of_object(&missing).unwrap_err().to_string();
        assert!(e.contains("metadata.name"), "e={}", e);
    }

    #[cfg(feature = "strip-managed-fields")]
    #[test]
    fn normalize_drops_managed_fields_only() {
        let mut v = json!({ "metadata": { "name": "x", "managedFields": [{ "manager": "m" }] }, "spec": {} });
        normalize(&mut v);
        assert_eq!(v, json!({ "metadata": { "name": "x" }, "spec": {} }));
    }
}
