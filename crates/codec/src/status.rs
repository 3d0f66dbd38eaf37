use serde::{Deserialize, Serialize};

/// The `Status` object the control plane returns for failures (and for deletes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: u16,
}

/// Canonical reason for an HTTP status code.
fn reason_for(code: u16) -> &'static str {
    match code {
        400 => "BadRequest",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "NotFound",
        409 => "Conflict",
        422 => "Invalid",
        429 => "TooManyRequests",
        500 => "InternalError",
        503 => "ServiceUnavailable",
        504 => "Timeout",
        _ => "Unknown",
    }
}

impl ApiStatus {
    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        Self::failure_with_reason(code, reason_for(code), message)
    }

    pub fn failure_with_reason(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self { status: "Failure".into(), message: message.into(), reason: reason.to_string(), code }
    }

    pub fn success() -> Self {
        Self { status: "Success".into(), code: 200, ..Default::default() }
    }

    /// Parse a `Status` body; `None` when the body is not one.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let v: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        if v.get("kind").and_then(|k| k.as_str()) != Some("Status") {
            return None;
        }
        serde_json::from_value(v).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": self.status,
            "message": self.message,
            "reason": self.reason,
            "code": self.code,
        })
        .to_string()
        .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_status_carries_reason() {
        let s = ApiStatus::failure(409, "the object has been modified");
        assert_eq!(s.reason, "Conflict");
        let back = ApiStatus::decode(&s.encode()).unwrap();
        assert_eq!(back, s);

        let exists = ApiStatus::failure_with_reason(409, "AlreadyExists", "widgets \"demo\" already exists");
        assert_eq!(ApiStatus::decode(&exists.encode()).unwrap().reason, "AlreadyExists");
    }

    #[test]
    fn non_status_bodies_are_ignored() {
        assert_eq!(ApiStatus::decode(br#"{"kind":"Pod","metadata":{"name":"x"}}"#), None);
        assert_eq!(ApiStatus::decode(b"<html>bad gateway</html>"), None);
    }
}
