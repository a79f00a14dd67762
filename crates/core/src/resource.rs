use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{names, ResourceInfo, WattError, WattResult};

/// A remote object in its wire shape: a JSON mapping with no fixed schema.
///
/// Cloning produces an independent copy, so values handed out by queries can be
/// mutated freely without touching the store they came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Map<String, Value>);

/// Identity of an object inside one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl From<Map<String, Value>> for Resource {
    fn from(m: Map<String, Value>) -> Self { Resource(m) }
}

impl TryFrom<Value> for Resource {
    type Error = WattError;

    fn try_from(v: Value) -> WattResult<Self> {
        match v {
            Value::Object(m) => Ok(Resource(m)),
            other => Err(WattError::Invalid(format!("expected a JSON object, got {}", type_name(&other)))),
        }
    }
}

impl From<Resource> for Value {
    fn from(r: Resource) -> Self { Value::Object(r.0) }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Resource {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn as_map(&self) -> &Map<String, Value> { &self.0 }
    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> { &mut self.0 }

    fn top_str(&self, field: &str) -> &str {
        self.0.get(field).and_then(|v| v.as_str()).unwrap_or("")
    }

    fn meta_str(&self, field: &str) -> &str {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn kind(&self) -> &str { self.top_str("kind") }
    pub fn api_version(&self) -> &str { self.top_str("apiVersion") }
    pub fn name(&self) -> &str { self.meta_str("name") }
    /// Empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str { self.meta_str("namespace") }
    /// Opaque per-object version token; compare for equality only.
    pub fn resource_version(&self) -> &str { self.meta_str("resourceVersion") }

    /// `name.namespace`, or just `name` when the object carries no namespace.
    pub fn qname(&self) -> String { names::qualified_name(self.name(), self.namespace()) }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace().to_string(), name: self.name().to_string() }
    }

    pub fn status(&self) -> Option<&Value> { self.0.get("status") }

    pub fn set_status(&mut self, status: Value) { self.0.insert("status".into(), status); }

    /// Fill `kind`/`apiVersion` when absent; list responses commonly omit them on items.
    pub fn fill_type_meta(&mut self, info: &ResourceInfo) {
        if self.kind().is_empty() {
            self.0.insert("kind".into(), Value::String(info.kind.clone()));
        }
        if self.api_version().is_empty() {
            self.0.insert("apiVersion".into(), Value::String(info.api_version()));
        }
    }

    /// Drop `metadata.managedFields`; it is large and never read here.
    pub fn strip_managed_fields(&mut self) {
        if let Some(meta) = self.0.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, ns: Option<&str>, rv: &str) -> Resource {
        let mut meta = json!({ "name": name, "resourceVersion": rv });
        if let Some(ns) = ns {
            meta["namespace"] = Value::String(ns.to_string());
        }
        Resource::try_from(json!({ "kind": "Pod", "apiVersion": "v1", "metadata": meta })).unwrap()
    }

    #[test]
    fn accessors_read_metadata() {
        let p = pod("web", Some("prod"), "42");
        assert_eq!(p.kind(), "Pod");
        assert_eq!(p.api_version(), "v1");
        assert_eq!(p.name(), "web");
        assert_eq!(p.namespace(), "prod");
        assert_eq!(p.resource_version(), "42");
        assert_eq!(p.qname(), "web.prod");
        assert_eq!(p.key().to_string(), "prod/web");
    }

    #[test]
    fn cluster_scoped_qname_is_bare_name() {
        let n = pod("node-1", None, "1");
        assert_eq!(n.namespace(), "");
        assert_eq!(n.qname(), "node-1");
        assert_eq!(n.key().to_string(), "node-1");
    }

    #[test]
    fn empty_resource_has_empty_accessors() {
        let r = Resource::new();
        assert!(r.is_empty());
        assert_eq!(r.name(), "");
        assert_eq!(r.resource_version(), "");
        assert!(r.status().is_none());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(Resource::try_from(json!([1, 2])), Err(WattError::Invalid(_))));
    }

    #[test]
    fn clones_are_independent() {
        let original = pod("web", Some("prod"), "1");
        let mut copy = original.clone();
        copy.set_status(json!({ "phase": "Running" }));
        assert!(original.status().is_none());
        assert_eq!(copy.status(), Some(&json!({ "phase": "Running" })));
    }

    #[test]
    fn fill_type_meta_only_when_missing() {
        let info = ResourceInfo {
            group: "apps".into(),
            version: "v1".into(),
            plural: "deployments".into(),
            kind: "Deployment".into(),
            namespaced: true,
        };
        let mut bare = Resource::try_from(json!({ "metadata": { "name": "d" } })).unwrap();
        bare.fill_type_meta(&info);
        assert_eq!(bare.kind(), "Deployment");
        assert_eq!(bare.api_version(), "apps/v1");

        let mut typed = pod("p", Some("ns"), "1");
        typed.fill_type_meta(&info);
        assert_eq!(typed.kind(), "Pod");
    }

    #[test]
    fn strips_managed_fields() {
        let mut r = Resource::try_from(json!({
            "metadata": { "name": "x", "managedFields": [{ "manager": "kubectl" }] }
        }))
        .unwrap();
        r.strip_managed_fields();
        assert!(r.as_map()["metadata"].get("managedFields").is_none());
        assert_eq!(r.name(), "x");
    }
}
