//! In-process control plane speaking the same HTTP semantics as the real one.
//!
//! Objects are kept as raw JSON keyed by `(group/version/plural, namespace, name)`.
//! Every mutation bumps a cluster-wide revision which becomes the object's
//! `resourceVersion`. Faults can be injected per verb to exercise error paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use keel_codec::{encode_list, ApiStatus};
use keel_core::{fold_string_data, ResourceKind, TransportError};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as Json};
use tracing::{debug, trace};

use crate::{query, ApiRequest, ApiResponse, Transport};

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("valid name regex")
});

/// Operation a request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
}

/// Injected failure: either a transport error or a canned HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Transport(TransportError),
    Status(u16),
}

type StoreKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, Json>,
    revision: u64,
    faults_once: FxHashMap<Verb, VecDeque<Fault>>,
    faults_always: FxHashMap<Verb, Fault>,
    counts: FxHashMap<Verb, u64>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_fault(&mut self, verb: Verb) -> Option<Fault> {
        if let Some(f) = self.faults_once.get_mut(&verb).and_then(|q| q.pop_front()) {
            return Some(f);
        }
        self.faults_always.get(&verb).cloned()
    }
}

#[derive(Debug)]
struct Route {
    collection: String,
    plural: String,
    namespace: String,
    name: Option<String>,
    params: Vec<(String, String)>,
}

impl Route {
    fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str()).filter(|v| !v.is_empty())
    }
}

fn parse_route(target: &str) -> Option<Route> {
    let (path, params) = query::split(target);
    let segs: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (gv, rest) = match segs.as_slice() {
        ["api", version, rest @ ..] => ((*version).to_string(), rest),
        ["apis", group, version, rest @ ..] => (format!("{}/{}", group, version), rest),
        _ => return None,
    };
    let (namespace, plural, name) = match rest {
        ["namespaces", ns, plural] => (*ns, *plural, None),
        ["namespaces", ns, plural, name] => (*ns, *plural, Some((*name).to_string())),
        [plural] => ("", *plural, None),
        [plural, name] => ("", *plural, Some((*name).to_string())),
        _ => return None,
    };
    Some(Route {
        collection: format!("{}/{}", gv, plural),
        plural: plural.to_string(),
        namespace: namespace.to_string(),
        name,
        params,
    })
}

fn status_response(code: u16, message: impl Into<String>) -> ApiResponse {
    ApiResponse::new(code, ApiStatus::failure(code, message).encode())
}

fn reason_response(code: u16, reason: &str, message: impl Into<String>) -> ApiResponse {
    ApiResponse::new(code, ApiStatus::failure_with_reason(code, reason, message).encode())
}

fn object_response(code: u16, obj: &Json) -> ApiResponse {
    ApiResponse::new(code, obj.to_string().into_bytes())
}

fn meta_str<'a>(obj: &'a Json, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

fn meta_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    let root = obj.as_object_mut()?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    meta.as_object_mut()
}

/// Everything except metadata and status: the part a generation tracks.
fn intent_of(obj: &Json) -> Json {
    let mut v = obj.clone();
    if let Some(o) = v.as_object_mut() {
        o.remove("metadata");
        o.remove("status");
    }
    v
}

/// Secrets store `stringData` as base64 `data`.
fn fold_secret(route: &Route, obj: &mut Json) {
    if route.collection == "v1/secrets" {
        if let Some(o) = obj.as_object_mut() {
            fold_string_data(o);
        }
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Some(t) = target.as_object_mut() {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

fn parse_selector(selector: &str) -> Vec<Requirement> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            if let Some((k, v)) = t.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = t.split_once("==").or_else(|| t.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = t.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(t.to_string())
            }
        })
        .collect()
}

fn selector_matches(reqs: &[Requirement], obj: &Json) -> bool {
    let labels = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object());
    let label = |k: &str| labels.and_then(|l| l.get(k)).and_then(|v| v.as_str());
    reqs.iter().all(|r| match r {
        Requirement::Equals(k, v) => label(k) == Some(v.as_str()),
        Requirement::NotEquals(k, v) => label(k) != Some(v.as_str()),
        Requirement::Exists(k) => label(k).is_some(),
        Requirement::NotExists(k) => label(k).is_none(),
    })
}

/// In-memory control plane. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryApiServer {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryApiServer {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Delay every response by `latency` (outside the state lock).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// Fail the next request of `verb` with `fault`. Queued faults fire in order.
    pub fn fail_next(&self, verb: Verb, fault: Fault) {
        self.lock().faults_once.entry(verb).or_default().push_back(fault);
    }

    /// Fail every request of `verb` with `fault` until cleared.
    pub fn fail_always(&self, verb: Verb, fault: Fault) {
        self.lock().faults_always.insert(verb, fault);
    }

    pub fn clear_faults(&self) {
        let mut st = self.lock();
        st.faults_once.clear();
        st.faults_always.clear();
    }

    /// Requests seen for `verb`, faulted ones included.
    pub fn request_count(&self, verb: Verb) -> u64 {
        self.lock().counts.get(&verb).copied().unwrap_or(0)
    }

    /// Current cluster-wide revision.
    pub fn revision(&self) -> u64 { self.lock().revision }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn key_for(kind: &ResourceKind, namespace: &str, name: &str) -> StoreKey {
        let ns = if kind.namespaced { namespace } else { "" };
        (format!("{}/{}", kind.api_version(), kind.plural), ns.to_string(), name.to_string())
    }

    /// Stored JSON of an object, if present.
    pub fn object(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Json> {
        self.lock().objects.get(&Self::key_for(kind, namespace, name)).cloned()
    }

    /// Write `status` the way a controller would; returns the new resourceVersion.
    pub fn set_status(&self, kind: &ResourceKind, namespace: &str, name: &str, status: Json) -> Option<String> {
        let mut st = self.lock();
        let key = Self::key_for(kind, namespace, name);
        if !st.objects.contains_key(&key) {
            return None;
        }
        let rv = st.next_revision();
        let obj = st.objects.get_mut(&key)?;
        if let Some(o) = obj.as_object_mut() {
            o.insert("status".into(), status);
        }
        if let Some(meta) = meta_mut(obj) {
            meta.insert("resourceVersion".into(), Json::String(rv.clone()));
        }
        Some(rv)
    }

    fn handle(&self, req: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let Some(route) = parse_route(&req.path) else {
            return Ok(status_response(404, format!("the server could not find the requested resource: {}", req.path)));
        };
        let verb = match (&req.method, route.name.is_some()) {
            (&Method::GET, true) => Verb::Get,
            (&Method::GET, false) => Verb::List,
            (&Method::POST, false) => Verb::Create,
            (&Method::PUT, true) => Verb::Update,
            (&Method::PATCH, true) => Verb::Patch,
            (&Method::DELETE, true) => Verb::Delete,
            _ => return Ok(status_response(405, format!("method {} not allowed on {}", req.method, req.path))),
        };

        let mut st = self.lock();
        *st.counts.entry(verb).or_insert(0) += 1;
        if let Some(fault) = st.take_fault(verb) {
            debug!(?verb, ?fault, path = %req.path, "injected fault");
            return match fault {
                Fault::Transport(e) => Err(e),
                Fault::Status(409) => Ok(status_response(409, "the object has been modified; please apply your changes to the latest version and try again")),
                Fault::Status(code) => Ok(status_response(code, "injected failure")),
            };
        }

        let body = match &req.body {
            Some(b) if !b.is_empty() => match serde_json::from_slice::<Json>(b) {
                Ok(v) if v.is_object() => Some(v),
                Ok(_) => return Ok(status_response(400, "request body must be a JSON object")),
                Err(e) => return Ok(status_response(400, format!("invalid JSON body: {}", e))),
            },
            _ => None,
        };

        trace!(?verb, path = %req.path, "handling");
        Ok(match verb {
            Verb::Get => Self::get(&st, &route),
            Verb::List => Self::list(&st, &route),
            Verb::Create => Self::create(&mut st, &route, body),
            Verb::Update => Self::update(&mut st, &route, body),
            Verb::Patch => Self::patch(&mut st, &route, body),
            Verb::Delete => Self::delete(&mut st, &route),
        })
    }

    fn item_key(route: &Route) -> StoreKey {
        (route.collection.clone(), route.namespace.clone(), route.name.clone().unwrap_or_default())
    }

    fn not_found(route: &Route) -> ApiResponse {
        status_response(404, format!("{} \"{}\" not found", route.plural, route.name.as_deref().unwrap_or("")))
    }

    fn get(st: &State, route: &Route) -> ApiResponse {
        match st.objects.get(&Self::item_key(route)) {
            Some(obj) => object_response(200, obj),
            None => Self::not_found(route),
        }
    }

    fn list(st: &State, route: &Route) -> ApiResponse {
        let limit = route.param("limit").and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0);
        let after = route.param("continue").and_then(|t| t.split_once('/')).map(|(ns, name)| (ns.to_string(), name.to_string()));
        let selector = route.param("labelSelector").map(parse_selector).unwrap_or_default();

        let matched = st.objects.iter().filter(|((coll, ns, name), obj)| {
            coll == &route.collection
                && (route.namespace.is_empty() || ns == &route.namespace)
                && after.as_ref().map(|(ans, aname)| (ns, name) > (ans, aname)).unwrap_or(true)
                && selector_matches(&selector, obj)
        });

        let mut items = Vec::new();
        let mut last: Option<(String, String)> = None;
        let mut more = false;
        for ((_, ns, name), obj) in matched {
            if limit.map(|l| items.len() >= l).unwrap_or(false) {
                more = true;
                break;
            }
            items.push(obj.clone());
            last = Some((ns.clone(), name.clone()));
        }
        let continue_token = if more { last.map(|(ns, name)| format!("{}/{}", ns, name)) } else { None };
        let (group_version, _) = route.collection.rsplit_once('/').unwrap_or(("v1", ""));
        let (group, version) = group_version.split_once('/').unwrap_or(("", group_version));
        let kind = ResourceKind::custom(group, version, "", &route.plural, true);
        ApiResponse::new(200, encode_list(&kind, &items, continue_token, Some(st.revision.to_string())))
    }

    fn create(st: &mut State, route: &Route, body: Option<Json>) -> ApiResponse {
        let Some(mut obj) = body else {
            return status_response(400, "request body required");
        };
        let name = match meta_str(&obj, "name") {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => return status_response(422, "metadata.name: Required value: name is required"),
        };
        if name.len() > 253 || !DNS_SUBDOMAIN.is_match(&name) {
            return status_response(422, format!("metadata.name: Invalid value: \"{}\": must be a lowercase RFC 1123 subdomain", name));
        }
        if let Some(ns) = meta_str(&obj, "namespace") {
            if !ns.is_empty() && !route.namespace.is_empty() && ns != route.namespace {
                return status_response(400, "the namespace of the provided object does not match the namespace sent on the request");
            }
        }
        if meta_str(&obj, "resourceVersion").is_some_and(|rv| !rv.is_empty()) {
            return status_response(422, "metadata.resourceVersion: Invalid value: must be unspecified for create");
        }
        let key = (route.collection.clone(), route.namespace.clone(), name.clone());
        if st.objects.contains_key(&key) {
            return reason_response(409, "AlreadyExists", format!("{} \"{}\" already exists", route.plural, name));
        }

        let rv = st.next_revision();
        fold_secret(route, &mut obj);
        if let Some(o) = obj.as_object_mut() {
            o.remove("status");
        }
        if let Some(meta) = meta_mut(&mut obj) {
            if !route.namespace.is_empty() {
                meta.insert("namespace".into(), Json::String(route.namespace.clone()));
            }
            meta.insert("resourceVersion".into(), Json::String(rv));
            meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
            meta.insert("generation".into(), Json::from(1));
            meta.insert(
                "creationTimestamp".into(),
                Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
        }
        debug!(collection = %route.collection, ns = %route.namespace, %name, "created");
        st.objects.insert(key, obj.clone());
        object_response(201, &obj)
    }

    /// Carry server-owned fields from `stored` onto `next` and decide whether it changed.
    fn finish_write(st: &mut State, key: StoreKey, stored: &Json, mut next: Json) -> ApiResponse {
        if let Some(o) = next.as_object_mut() {
            match stored.get("status") {
                Some(s) => { o.insert("status".into(), s.clone()); }
                None => { o.remove("status"); }
            }
        }
        let generation = stored.pointer("/metadata/generation").and_then(|g| g.as_i64()).unwrap_or(1);
        let intent_changed = intent_of(stored) != intent_of(&next);
        if let Some(meta) = meta_mut(&mut next) {
            for field in ["name", "namespace", "uid", "creationTimestamp", "resourceVersion"] {
                match stored.get("metadata").and_then(|m| m.get(field)) {
                    Some(v) => { meta.insert(field.into(), v.clone()); }
                    None => { meta.remove(field); }
                }
            }
            meta.insert("generation".into(), Json::from(if intent_changed { generation + 1 } else { generation }));
        }
        if &next == stored {
            // no-op writes do not bump the revision
            return object_response(200, stored);
        }
        let rv = st.next_revision();
        if let Some(meta) = meta_mut(&mut next) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        st.objects.insert(key, next.clone());
        object_response(200, &next)
    }

    fn conflict(route: &Route) -> ApiResponse {
        reason_response(
            409,
            "Conflict",
            format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                route.plural,
                route.name.as_deref().unwrap_or("")
            ),
        )
    }

    fn update(st: &mut State, route: &Route, body: Option<Json>) -> ApiResponse {
        let Some(mut obj) = body else {
            return status_response(400, "request body required");
        };
        if meta_str(&obj, "name") != route.name.as_deref() {
            return status_response(400, "the name of the object does not match the name on the URL");
        }
        let key = Self::item_key(route);
        let Some(stored) = st.objects.get(&key).cloned() else {
            return Self::not_found(route);
        };
        if let Some(rv) = meta_str(&obj, "resourceVersion").filter(|rv| !rv.is_empty()) {
            if Some(rv) != meta_str(&stored, "resourceVersion") {
                return Self::conflict(route);
            }
        }
        fold_secret(route, &mut obj);
        Self::finish_write(st, key, &stored, obj)
    }

    fn patch(st: &mut State, route: &Route, body: Option<Json>) -> ApiResponse {
        let Some(patch) = body else {
            return status_response(400, "patch body required");
        };
        let key = Self::item_key(route);
        let Some(stored) = st.objects.get(&key).cloned() else {
            return Self::not_found(route);
        };
        if let Some(rv) = meta_str(&patch, "resourceVersion").filter(|rv| !rv.is_empty()) {
            if Some(rv) != meta_str(&stored, "resourceVersion") {
                return Self::conflict(route);
            }
        }
        let mut next = stored.clone();
        merge_patch(&mut next, &patch);
        fold_secret(route, &mut next);
        Self::finish_write(st, key, &stored, next)
    }

    fn delete(st: &mut State, route: &Route) -> ApiResponse {
        let key = Self::item_key(route);
        if st.objects.remove(&key).is_none() {
            return Self::not_found(route);
        }
        st.next_revision();
        debug!(collection = %route.collection, ns = %route.namespace, name = ?route.name, "deleted");
        ApiResponse::new(200, ApiStatus::success().encode())
    }
}

#[async_trait]
impl Transport for MemoryApiServer {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        self.handle(&req).and_then(ApiResponse::into_checked)
    }
}
