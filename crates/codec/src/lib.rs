//! Keel codec: wire documents <-> typed resources.
//!
//! JSON is the wire format; YAML is accepted for manifests. Unknown fields are
//! carried through untouched, so `decode(encode(r)) == r` for any well-formed `r`.

#![forbid(unsafe_code)]

use keel_core::{CodecError, Resource, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::trace;

mod status;

pub use status::ApiStatus;

/// Manifest size guards. Both can be raised through the environment.
#[derive(Debug, Clone, Copy)]
struct Limits {
    bytes: usize,
    nodes: usize,
}

impl Limits {
    fn from_env() -> Self {
        Self { bytes: env_limit("KEEL_MAX_YAML_BYTES", 1 << 20), nodes: env_limit("KEEL_MAX_YAML_NODES", 100_000) }
    }
}

fn env_limit(key: &str, default: usize) -> usize {
    match std::env::var(key).map(|s| s.trim().parse::<usize>()) {
        Ok(Ok(n)) if n > 0 => n,
        _ => default,
    }
}

/// Counts the values in `root`, stopping once `cap` have been seen.
fn count_nodes(root: &Json, cap: usize) -> usize {
    let mut pending = vec![root];
    let mut seen = 0;
    while let Some(v) = pending.pop() {
        seen += 1;
        if seen >= cap {
            break;
        }
        match v {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    seen
}

fn required_str<'a>(v: &'a Json, pointer: &str, field: &str) -> Result<&'a str, CodecError> {
    match v.pointer(pointer) {
        None | Some(Json::Null) => Err(CodecError::MissingField(field.to_string())),
        Some(Json::String(s)) if s.is_empty() => Err(CodecError::MissingField(field.to_string())),
        Some(Json::String(s)) => Ok(s),
        Some(other) => Err(CodecError::Malformed(format!("{} must be a string, got {}", field, other))),
    }
}

/// Validate required fields, then convert into a typed resource.
pub fn decode_value(v: Json) -> Result<Resource, CodecError> {
    if !v.is_object() {
        return Err(CodecError::Malformed("expected an object at document root".into()));
    }
    required_str(&v, "/kind", "kind")?;
    required_str(&v, "/metadata/name", "metadata.name")?;
    serde_json::from_value(v).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decode a single JSON document.
pub fn decode(bytes: &[u8]) -> Result<Resource, CodecError> {
    let v: Json = serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    decode_value(v)
}

pub fn to_value(r: &Resource) -> Result<Json, CodecError> {
    serde_json::to_value(r).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encode to JSON bytes.
pub fn encode(r: &Resource) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(r).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Render as a YAML document, for human output.
pub fn to_yaml(r: &Resource) -> Result<String, CodecError> {
    serde_yaml::to_string(r).map_err(|e| CodecError::Malformed(e.to_string()))
}

fn yaml_to_json(val: serde_yaml::Value) -> Result<Json, CodecError> {
    let json = serde_json::to_value(val).map_err(|e| CodecError::Malformed(format!("converting YAML to JSON: {}", e)))?;
    let limit = Limits::from_env().nodes;
    if count_nodes(&json, limit.saturating_add(1)) > limit {
        return Err(CodecError::TooLarge { what: "YAML node count", limit });
    }
    Ok(json)
}

fn check_yaml_size(yaml: &str) -> Result<(), CodecError> {
    let limit = Limits::from_env().bytes;
    if yaml.len() > limit {
        return Err(CodecError::TooLarge { what: "YAML payload bytes", limit });
    }
    Ok(())
}

/// Decode a single YAML manifest.
pub fn decode_yaml(yaml: &str) -> Result<Resource, CodecError> {
    check_yaml_size(yaml)?;
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| CodecError::Malformed(format!("parsing YAML: {}", e)))?;
    decode_value(yaml_to_json(val)?)
}

/// Decode every document of a `---` separated manifest. Empty documents are skipped.
pub fn decode_yaml_documents(yaml: &str) -> Result<Vec<Resource>, CodecError> {
    check_yaml_size(yaml)?;
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|e| CodecError::Malformed(format!("parsing YAML document {}: {}", idx, e)))?;
        if val.is_null() { continue; }
        out.push(decode_value(yaml_to_json(val)?)?);
    }
    trace!(documents = out.len(), "decoded manifest");
    Ok(out)
}

/// One page of a list response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    /// Present when more pages follow.
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default, rename = "continue", skip_serializing_if = "Option::is_none")]
    continue_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Option<Vec<Json>>,
}

/// Decode a list envelope. Items usually omit `apiVersion`/`kind`; those are
/// filled in from `kind` before validation.
pub fn decode_list(bytes: &[u8], kind: &ResourceKind) -> Result<ResourceList, CodecError> {
    let env: ListEnvelope = serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let mut items = Vec::new();
    for mut item in env.items.unwrap_or_default() {
        if let Some(obj) = item.as_object_mut() {
            obj.entry("apiVersion").or_insert_with(|| Json::String(kind.api_version()));
            obj.entry("kind").or_insert_with(|| Json::String(kind.kind.clone()));
        }
        items.push(decode_value(item)?);
    }
    let continue_token = env.metadata.continue_token.filter(|t| !t.is_empty());
    Ok(ResourceList { items, continue_token, resource_version: env.metadata.resource_version })
}

/// Encode a list envelope in the shape `decode_list` reads.
pub fn encode_list(kind: &ResourceKind, items: &[Json], continue_token: Option<String>, resource_version: Option<String>) -> Vec<u8> {
    let meta = ListMeta { continue_token, resource_version };
    let body = serde_json::json!({
        "apiVersion": kind.api_version(),
        "kind": format!("{}List", kind.kind),
        "metadata": meta,
        "items": items,
    });
    body.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_errors_name_the_missing_field() {
        let e1 = decode(br#"{"apiVersion":"v1","metadata":{"name":"x"}}"#).unwrap_err();
        assert_eq!(e1, CodecError::MissingField("kind".into()));

        let e2 = decode(br#"{"apiVersion":"v1","kind":"Pod","metadata":{}}"#).unwrap_err();
        assert_eq!(e2, CodecError::MissingField("metadata.name".into()));

        let e3 = decode(br#"{"kind":"Pod"}"#).unwrap_err();
        assert_eq!(e3, CodecError::MissingField("metadata.name".into()));

        let e4 = decode(b"{not json").unwrap_err();
        assert!(matches!(e4, CodecError::Malformed(_)), "e4={:?}", e4);

        let e5 = decode(br#"{"kind":"Pod","metadata":{"name":"x","labels":{"a":1}}}"#).unwrap_err();
        assert!(matches!(e5, CodecError::Malformed(_)), "e5={:?}", e5);

        let e6 = decode(br#"["kind"]"#).unwrap_err();
        assert!(matches!(e6, CodecError::Malformed(_)), "e6={:?}", e6);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({
            "apiVersion": "example.dev/v1",
            "kind": "Widget",
            "metadata": {
                "name": "demo",
                "namespace": "default",
                "resourceVersion": "7",
                "ownerReferences": [{ "kind": "Gadget", "name": "g" }],
                "labels": { "app": "demo" }
            },
            "spec": { "replicas": 2, "futureKnob": { "nested": [1, 2, 3] } },
            "status": { "ready": 1 },
            "x-extension": true
        });
        let r = decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(r.resource_version(), Some("7"));
        assert_eq!(r.extra.get("x-extension"), Some(&json!(true)));
        let back: Json = serde_json::from_slice(&encode(&r).unwrap()).unwrap();
        assert_eq!(back, raw);
        assert_eq!(decode(&encode(&r).unwrap()).unwrap(), r);
    }

    #[test]
    fn multi_document_manifest() {
        let y = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: demo-deployment\nspec:\n  replicas: 2\n---\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: demo-service\nspec:\n  type: LoadBalancer\n";
        let docs = decode_yaml_documents(y).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].kind, "Deployment");
        assert_eq!(docs[0].spec, Some(json!({ "replicas": 2 })));
        assert_eq!(docs[1].name(), "demo-service");

        let rendered = to_yaml(&docs[0]).unwrap();
        assert!(rendered.contains("name: demo-deployment"), "{}", rendered);
        assert_eq!(decode_yaml(&rendered).unwrap(), docs[0]);
    }

    #[test]
    fn yaml_errors_are_friendly() {
        let e1 = decode_yaml("kind: Foo\nmetadata: {}\n").unwrap_err();
        assert_eq!(e1.to_string(), "missing required field metadata.name");

        let e2 = decode_yaml("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err();
        assert_eq!(e2.to_string(), "missing required field kind");

        let e3 = decode_yaml("a: [unclosed").unwrap_err();
        assert!(e3.to_string().contains("parsing YAML"), "e3={}", e3);
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let v = json!({ "a": [1, 2, 3], "b": { "c": null } });
        // root, a, 1, 2, 3, b, c
        assert_eq!(count_nodes(&v, usize::MAX), 7);
        assert_eq!(count_nodes(&v, 4), 4);
    }

    #[test]
    fn list_items_inherit_kind() {
        let kind = ResourceKind::pod();
        let body = json!({
            "kind": "PodList",
            "apiVersion": "v1",
            "metadata": { "continue": "tok", "resourceVersion": "42" },
            "items": [
                { "metadata": { "name": "a", "namespace": "default" } },
                { "metadata": { "name": "b", "namespace": "kube-system" } }
            ]
        });
        let list = decode_list(body.to_string().as_bytes(), &kind).unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].kind, "Pod");
        assert_eq!(list.items[1].api_version, "v1");
        assert_eq!(list.continue_token.as_deref(), Some("tok"));
        assert_eq!(list.resource_version.as_deref(), Some("42"));

        let last = decode_list(br#"{"metadata":{"continue":""},"items":null}"#, &kind).unwrap();
        assert!(last.items.is_empty());
        assert_eq!(last.continue_token, None);
    }

    #[test]
    fn encode_list_is_readable_by_decode_list() {
        let kind = ResourceKind::service();
        let items = vec![json!({ "metadata": { "name": "svc" } })];
        let bytes = encode_list(&kind, &items, Some("next".into()), Some("9".into()));
        let list = decode_list(&bytes, &kind).unwrap();
        assert_eq!(list.items[0].name(), "svc");
        assert_eq!(list.continue_token.as_deref(), Some("next"));
    }
}
