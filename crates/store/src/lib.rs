//! Keel store: per-kind object store client.
//!
//! Every write is checked by the control plane against `resourceVersion`;
//! a stale version comes back as [`StoreError::Conflict`] and the caller
//! must re-read before writing again.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use keel_codec::{decode, decode_list, encode, ApiStatus, ResourceList};
use keel_core::{ObjectKey, Resource, ResourceKind, StoreError};
use keel_transport::{query, ApiRequest, ApiResponse, Transport};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

fn default_page_size() -> u32 {
    std::env::var("KEEL_LIST_PAGE_SIZE")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(500)
}

/// Options for `list_with`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParams {
    /// Equality-based selector, e.g. `app=demo,tier!=db`.
    pub label_selector: Option<String>,
    /// Items per request; the client default when unset.
    pub page_size: Option<u32>,
}

impl ListParams {
    pub fn labels(selector: &str) -> Self {
        Self { label_selector: Some(selector.to_string()), ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

/// Options forwarded to the server with a delete. Nothing is cascaded unless asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation_policy: Option<PropagationPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i64>,
}

impl DeleteParams {
    fn is_default(&self) -> bool { self == &DeleteParams::default() }
}

/// Client for one resource kind. Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct ResourceClient {
    transport: Arc<dyn Transport>,
    kind: ResourceKind,
    page_size: u32,
}

fn require_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::Validation("metadata.name is required".into()));
    }
    Ok(())
}

impl ResourceClient {
    pub fn new(transport: Arc<dyn Transport>, kind: ResourceKind) -> Self {
        Self { transport, kind, page_size: default_page_size() }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }

    fn key(&self, namespace: &str, name: &str) -> ObjectKey {
        let ns = if self.kind.namespaced { namespace } else { "" };
        ObjectKey::new(self.kind.kind.clone(), ns, name)
    }

    fn require_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        if self.kind.namespaced && namespace.is_empty() {
            return Err(StoreError::Validation(format!("namespace required for namespaced kind {}", self.kind.kind)));
        }
        Ok(())
    }

    fn require_target(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.require_namespace(namespace)?;
        require_name(name)
    }

    fn check_kind(&self, r: &Resource) -> Result<(), StoreError> {
        if r.kind != self.kind.kind {
            return Err(StoreError::Validation(format!("{} client cannot write kind {}", self.kind.kind, r.kind)));
        }
        if !r.api_version.is_empty() && r.api_version != self.kind.api_version() {
            return Err(StoreError::Validation(format!(
                "apiVersion {} does not match {}", r.api_version, self.kind.api_version()
            )));
        }
        require_name(&r.metadata.name)
    }

    /// Normalize the envelope the way the server expects it.
    fn prepare(&self, r: &Resource) -> Result<Resource, StoreError> {
        self.check_kind(r)?;
        let mut out = r.clone();
        out.api_version = self.kind.api_version();
        if self.kind.namespaced {
            self.require_namespace(r.namespace())?;
        } else {
            out.metadata.namespace = None;
        }
        Ok(out)
    }

    async fn send(&self, verb: &'static str, req: ApiRequest) -> Result<ApiResponse, StoreError> {
        counter!("keel_store_requests_total", 1u64, "verb" => verb);
        debug!(kind = %self.kind.kind, verb, path = %req.path, "store request");
        match self.transport.request(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                counter!("keel_store_errors_total", 1u64, "verb" => verb);
                warn!(kind = %self.kind.kind, verb, error = %e, "transport failed");
                Err(e.into())
            }
        }
    }

    fn failure(&self, verb: &'static str, key: ObjectKey, resp: &ApiResponse) -> StoreError {
        counter!("keel_store_errors_total", 1u64, "verb" => verb);
        let status = ApiStatus::decode(&resp.body).unwrap_or_default();
        let message = if status.message.is_empty() {
            String::from_utf8_lossy(&resp.body).into_owned()
        } else {
            status.message
        };
        let err = match resp.status {
            404 => StoreError::NotFound(key),
            409 if verb == "create" || status.reason == "AlreadyExists" => StoreError::AlreadyExists(key),
            409 => StoreError::Conflict { key, message },
            400 | 422 => StoreError::Validation(message),
            code => StoreError::Unexpected { status: code, message },
        };
        if resp.status == 404 {
            debug!(kind = %self.kind.kind, verb, error = %err, "store request rejected");
        } else {
            warn!(kind = %self.kind.kind, verb, status = resp.status, error = %err, "store request rejected");
        }
        err
    }

    fn decode_object(&self, resp: &ApiResponse) -> Result<Resource, StoreError> {
        let mut r = decode(&resp.body)?;
        if r.api_version.is_empty() {
            r.api_version = self.kind.api_version();
        }
        Ok(r)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Resource, StoreError> {
        self.require_target(namespace, name)?;
        let resp = self.send("get", ApiRequest::get(self.kind.item_path(namespace, name))).await?;
        if !resp.is_success() {
            return Err(self.failure("get", self.key(namespace, name), &resp));
        }
        self.decode_object(&resp)
    }

    /// List objects; an empty namespace means all namespaces.
    pub fn list(&self, namespace: &str) -> Listing {
        self.list_with(namespace, ListParams::default())
    }

    pub fn list_with(&self, namespace: &str, params: ListParams) -> Listing {
        Listing { client: self.clone(), namespace: namespace.to_string(), params }
    }

    async fn fetch_page(&self, namespace: &str, params: &ListParams, token: Option<String>) -> Result<ResourceList, StoreError> {
        let limit = params.page_size.unwrap_or(self.page_size).max(1);
        let path = query::with_query(&self.kind.collection_path(namespace), &[
            ("limit", limit.to_string()),
            ("continue", token.unwrap_or_default()),
            ("labelSelector", params.label_selector.clone().unwrap_or_default()),
        ]);
        let resp = self.send("list", ApiRequest::get(path)).await?;
        if !resp.is_success() {
            return Err(self.failure("list", self.key(namespace, ""), &resp));
        }
        let page = decode_list(&resp.body, &self.kind)?;
        debug!(kind = %self.kind.kind, ns = %namespace, items = page.items.len(), more = page.continue_token.is_some(), "list page");
        Ok(page)
    }

    /// Create; the server assigns the initial `resourceVersion`.
    pub async fn create(&self, r: &Resource) -> Result<Resource, StoreError> {
        if r.resource_version().is_some() {
            return Err(StoreError::Validation("metadata.resourceVersion must be unset on create".into()));
        }
        let r = self.prepare(r)?;
        let body = encode(&r)?;
        let resp = self.send("create", ApiRequest::post(self.kind.collection_path(r.namespace()), body)).await?;
        if !resp.is_success() {
            return Err(self.failure("create", r.key(), &resp));
        }
        let created = self.decode_object(&resp)?;
        debug!(key = %created.key(), rv = ?created.resource_version(), "created");
        Ok(created)
    }

    /// Replace the object. Fails with `Conflict` when `resourceVersion` is stale.
    pub async fn update(&self, r: &Resource) -> Result<Resource, StoreError> {
        if r.resource_version().map(str::is_empty).unwrap_or(true) {
            return Err(StoreError::Validation("metadata.resourceVersion is required for update".into()));
        }
        let r = self.prepare(r)?;
        let body = encode(&r)?;
        let resp = self.send("update", ApiRequest::put(self.kind.item_path(r.namespace(), r.name()), body)).await?;
        if !resp.is_success() {
            return Err(self.failure("update", r.key(), &resp));
        }
        let updated = self.decode_object(&resp)?;
        debug!(key = %updated.key(), rv = ?updated.resource_version(), "updated");
        Ok(updated)
    }

    /// JSON merge patch; no version needed.
    pub async fn patch(&self, namespace: &str, name: &str, patch: &Json) -> Result<Resource, StoreError> {
        self.require_target(namespace, name)?;
        if !patch.is_object() {
            return Err(StoreError::Validation("merge patch must be a JSON object".into()));
        }
        let req = ApiRequest::merge_patch(self.kind.item_path(namespace, name), patch.to_string().into_bytes());
        let resp = self.send("patch", req).await?;
        if !resp.is_success() {
            return Err(self.failure("patch", self.key(namespace, name), &resp));
        }
        self.decode_object(&resp)
    }

    /// Delete; a missing object is `NotFound`, not a no-op.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_with(namespace, name, &DeleteParams::default()).await
    }

    pub async fn delete_with(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<(), StoreError> {
        self.require_target(namespace, name)?;
        let body = if params.is_default() {
            None
        } else {
            let mut opts = serde_json::to_value(params).map_err(|e| StoreError::Validation(e.to_string()))?;
            if let Some(o) = opts.as_object_mut() {
                o.insert("kind".into(), Json::String("DeleteOptions".into()));
                o.insert("apiVersion".into(), Json::String("v1".into()));
            }
            Some(opts.to_string().into_bytes())
        };
        let resp = self.send("delete", ApiRequest::delete(self.kind.item_path(namespace, name), body)).await?;
        if !resp.is_success() {
            return Err(self.failure("delete", self.key(namespace, name), &resp));
        }
        debug!(key = %self.key(namespace, name), "deleted");
        Ok(())
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// A restartable listing. Nothing is fetched until a stream is polled; each
/// call to [`Listing::stream`] starts again from the first page.
#[derive(Clone)]
pub struct Listing {
    client: ResourceClient,
    namespace: String,
    params: ListParams,
}

impl Listing {
    /// Items of every page in order, fetched one page at a time.
    pub fn stream(&self) -> BoxStream<'static, Result<Resource, StoreError>> {
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let params = self.params.clone();
        stream::try_unfold(Cursor::Start, move |cursor| {
            let client = client.clone();
            let namespace = namespace.clone();
            let params = params.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(t) => Some(t),
                };
                let page = client.fetch_page(&namespace, &params, token).await?;
                let next = match page.continue_token {
                    Some(t) => Cursor::Next(t),
                    None => Cursor::Done,
                };
                Ok::<_, StoreError>(Some((page.items, next)))
            }
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<_, StoreError>)))
        .try_flatten()
        .boxed()
    }

    pub async fn collect(&self) -> Result<Vec<Resource>, StoreError> {
        self.stream().try_collect().await
    }
}
