//! Desired-versus-observed comparison.
//!
//! Only what the caller asked for is compared: a field the server defaulted
//! (present in the observed object, absent from the desired one) is not drift.

use keel_core::{Resource, ResourceKind};
use serde_json::Value as Json;

/// `observed` carries everything `desired` says, recursively.
fn covers(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Object(d), Json::Object(o)) => d.iter().all(|(k, dv)| match o.get(k) {
            Some(ov) => covers(dv, ov),
            None => dv.is_null(),
        }),
        (Json::Array(d), Json::Array(o)) => d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| covers(dv, ov)),
        (d, o) => d == o,
    }
}

/// Put `desired` in the shape the server stores. A Secret's `stringData`
/// is only ever read back as base64 `data`.
pub fn normalize(kind: &ResourceKind, desired: &mut Resource) {
    if kind.desired_fields.contains(&"stringData") {
        desired.fold_string_data();
    }
}

/// Names of the intent fields, labels and annotations that still differ.
pub fn drift(kind: &ResourceKind, desired: &Resource, observed: &Resource) -> Vec<String> {
    let mut out = Vec::new();
    for field in kind.desired_fields {
        if let Some(want) = desired.field(field) {
            let ok = match observed.field(field) {
                Some(have) => covers(want, have),
                None => want.is_null(),
            };
            if !ok {
                out.push(field.to_string());
            }
        }
    }
    for (k, v) in &desired.metadata.labels {
        if observed.metadata.labels.get(k) != Some(v) {
            out.push(format!("labels.{}", k));
        }
    }
    for (k, v) in &desired.metadata.annotations {
        if observed.metadata.annotations.get(k) != Some(v) {
            out.push(format!("annotations.{}", k));
        }
    }
    out
}

/// The last observed object with desired intent laid over it. Keeps the
/// observed `resourceVersion` so the write is checked against what was read.
pub fn overlay(kind: &ResourceKind, desired: &Resource, observed: &Resource) -> Resource {
    let mut next = observed.clone();
    for field in kind.desired_fields {
        if let Some(want) = desired.field(field) {
            next.set_field(field, Some(want.clone()));
        }
    }
    for (k, v) in &desired.metadata.labels {
        next.metadata.labels.insert(k.clone(), v.clone());
    }
    for (k, v) in &desired.metadata.annotations {
        next.metadata.annotations.insert(k.clone(), v.clone());
    }
    next
}
