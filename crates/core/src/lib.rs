//! Keel core types: the resource envelope, object identity and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod error;
pub mod kinds;

pub use error::{CodecError, StoreError, TransportError};
pub use kinds::ResourceKind;

pub mod prelude {
    pub use super::{CodecError, ObjectKey, ObjectMeta, Resource, ResourceKind, StoreError, TransportError};
}

/// Composite identity of a live object: `(kind, namespace, name)`.
///
/// Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Object metadata. Fields the client does not model are kept in `extra`
/// so they survive a decode/encode cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Opaque revision token; bumped by the server on every mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A control-plane object in the `apiVersion/kind/metadata/spec/status` envelope.
///
/// Top-level fields other than the modelled ones (for example `data` on a
/// Secret) live in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub spec: Option<Value>,
    /// Server-computed; read-only to callers.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub status: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A field that is on the wire, even as `null`, is `Some`.
fn present<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
}

/// Fold a Secret's write-only `stringData` into base64 `data`, as the
/// control plane does on write. `stringData` wins on key collisions.
pub fn fold_string_data(obj: &mut Map<String, Value>) {
    let Some(Value::Object(plain)) = obj.remove("stringData") else {
        return;
    };
    let data = obj.entry("data").or_insert_with(|| Value::Object(Map::new()));
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Value::Object(data) = data {
        for (k, v) in plain {
            if let Value::String(s) = v {
                data.insert(k, Value::String(STANDARD.encode(s.as_bytes())));
            }
        }
    }
}

impl Resource {
    /// Empty object of the given kind, addressed by namespace and name.
    pub fn new(kind: &ResourceKind, namespace: &str, name: &str) -> Self {
        let namespace = if kind.namespaced && !namespace.is_empty() { Some(namespace.to_string()) } else { None };
        Self {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
            metadata: ObjectMeta { name: name.to_string(), namespace, ..Default::default() },
            ..Default::default()
        }
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }

    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind.clone(), self.namespace(), self.name())
    }

    /// Read a top-level intent field (`spec` or anything kept in `extra`).
    pub fn field(&self, name: &str) -> Option<&Value> {
        match name {
            "spec" => self.spec.as_ref(),
            "status" => self.status.as_ref(),
            other => self.extra.get(other),
        }
    }

    pub fn fold_string_data(&mut self) {
        fold_string_data(&mut self.extra);
    }

    /// Replace a top-level intent field; `None` removes it.
    pub fn set_field(&mut self, name: &str, value: Option<Value>) {
        match (name, value) {
            ("spec", v) => self.spec = v,
            ("status", v) => self.status = v,
            (other, Some(v)) => { self.extra.insert(other.to_string(), v); }
            (other, None) => { self.extra.remove(other); }
        }
    }
}
