//! Resource kind descriptors and the built-in kind registry.
//!
//! A descriptor knows how to address its objects on the control plane
//! (group/version/plural and scope) and which top-level fields carry the
//! caller's intent.

use serde::{Deserialize, Serialize};

const SPEC_FIELDS: &[&str] = &["spec"];
const SECRET_FIELDS: &[&str] = &["data", "stringData", "type"];
const CONFIG_MAP_FIELDS: &[&str] = &["data", "binaryData"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKind {
    /// API group; empty for the core group.
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Lowercase plural used in request paths.
    pub plural: String,
    pub namespaced: bool,
    /// Top-level fields compared during reconciliation.
    #[serde(skip, default = "default_desired_fields")]
    pub desired_fields: &'static [&'static str],
}

fn default_desired_fields() -> &'static [&'static str] { SPEC_FIELDS }

fn builtin(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool, desired_fields: &'static [&'static str]) -> ResourceKind {
    ResourceKind {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
        namespaced,
        desired_fields,
    }
}

impl ResourceKind {
    /// Descriptor for a custom resource whose intent lives under `spec`.
    pub fn custom(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        builtin(group, version, kind, plural, namespaced, SPEC_FIELDS)
    }

    pub fn pod() -> Self { builtin("", "v1", "Pod", "pods", true, SPEC_FIELDS) }
    pub fn node() -> Self { builtin("", "v1", "Node", "nodes", false, SPEC_FIELDS) }
    pub fn service() -> Self { builtin("", "v1", "Service", "services", true, SPEC_FIELDS) }
    pub fn secret() -> Self { builtin("", "v1", "Secret", "secrets", true, SECRET_FIELDS) }
    pub fn config_map() -> Self { builtin("", "v1", "ConfigMap", "configmaps", true, CONFIG_MAP_FIELDS) }
    pub fn deployment() -> Self { builtin("apps", "v1", "Deployment", "deployments", true, SPEC_FIELDS) }

    /// `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    fn prefix(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    /// Collection path. An empty namespace addresses all namespaces; cluster-scoped
    /// kinds ignore the namespace.
    pub fn collection_path(&self, namespace: &str) -> String {
        if self.namespaced && !namespace.is_empty() {
            format!("{}/namespaces/{}/{}", self.prefix(), namespace, self.plural)
        } else {
            format!("{}/{}", self.prefix(), self.plural)
        }
    }

    pub fn item_path(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }

    /// Resolve a built-in by kind, singular or plural name (case-insensitive).
    pub fn lookup(name: &str) -> Option<Self> {
        let needle = name.to_ascii_lowercase();
        builtin_kinds().into_iter().find(|k| {
            let kind = k.kind.to_ascii_lowercase();
            kind == needle || k.plural == needle
        })
    }

    /// Resolve a built-in by `apiVersion` and `kind` as they appear in a manifest.
    pub fn lookup_gvk(api_version: &str, kind: &str) -> Option<Self> {
        builtin_kinds().into_iter().find(|k| k.api_version() == api_version && k.kind == kind)
    }
}

/// All kinds the client knows how to address without discovery.
pub fn builtin_kinds() -> Vec<ResourceKind> {
    vec![
        ResourceKind::pod(),
        ResourceKind::node(),
        ResourceKind::service(),
        ResourceKind::secret(),
        ResourceKind::config_map(),
        ResourceKind::deployment(),
    ]
}
