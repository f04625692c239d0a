//! Helpers for building admission responses
//!
//! Thin constructors over [`kube::core::admission::AdmissionResponse`] so
//! handlers read declaratively. All of them take the request so the `uid`
//! is carried over; the server adapter re-asserts it before writing the
//! envelope either way.

use json_patch::Patch;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use serde::Serialize;

/// Allow the request
pub fn allowed(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    AdmissionResponse::from(req)
}

/// Allow the request with an informational message
pub fn allowed_with_message(
    req: &AdmissionRequest<DynamicObject>,
    message: impl Into<String>,
) -> AdmissionResponse {
    let mut resp = AdmissionResponse::from(req);
    resp.result.message = message.into();
    resp
}

/// Deny the request with a message (status code 403, reason Forbidden)
pub fn denied(
    req: &AdmissionRequest<DynamicObject>,
    message: impl ToString,
) -> AdmissionResponse {
    let mut resp = AdmissionResponse::from(req).deny(message);
    resp.result.code = 403;
    resp.result.reason = "Forbidden".to_string();
    resp
}

/// Deny the request with a specific reason and status code
pub fn denied_with_code(
    req: &AdmissionRequest<DynamicObject>,
    message: impl ToString,
    reason: impl Into<String>,
    code: u16,
) -> AdmissionResponse {
    let mut resp = AdmissionResponse::from(req).deny(message);
    resp.result.code = code;
    resp.result.reason = reason.into();
    resp
}

/// Fail the request because the handler itself errored (code 500)
pub fn errored(
    req: &AdmissionRequest<DynamicObject>,
    message: impl ToString,
) -> AdmissionResponse {
    let mut resp = AdmissionResponse::from(req).deny(message);
    resp.result.code = 500;
    resp.result.reason = "InternalError".to_string();
    resp
}

/// Allow the request with a JSON patch computed from two object versions.
///
/// Serializes both, diffs them, and attaches the resulting patch. An
/// identical pair allows without a patch; serialization failures degrade to
/// an errored response.
pub fn patch_response<T: Serialize>(
    req: &AdmissionRequest<DynamicObject>,
    original: &T,
    modified: &T,
) -> AdmissionResponse {
    let original = match serde_json::to_value(original) {
        Ok(v) => v,
        Err(e) => return errored(req, format!("failed to serialize original object: {}", e)),
    };
    let modified = match serde_json::to_value(modified) {
        Ok(v) => v,
        Err(e) => return errored(req, format!("failed to serialize modified object: {}", e)),
    };

    let patch = json_patch::diff(&original, &modified);
    patch_response_from_patch(req, patch)
}

/// Allow the request with a pre-built JSON patch
pub fn patch_response_from_patch(
    req: &AdmissionRequest<DynamicObject>,
    patch: Patch,
) -> AdmissionResponse {
    if patch.0.is_empty() {
        return allowed(req);
    }
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(resp) => resp,
        Err(e) => errored(req, format!("failed to attach patch: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::admission::AdmissionReview;
    use serde_json::json;

    fn request() -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default"}
                }
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn allowed_carries_uid() {
        let req = request();
        let resp = allowed(&req);
        assert!(resp.allowed);
        assert_eq!(resp.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
    }

    #[test]
    fn denied_carries_message_and_code() {
        let resp = denied(&request(), "pods must carry an owner label");
        assert!(!resp.allowed);
        assert_eq!(resp.result.code, 403);
        assert_eq!(resp.result.reason, "Forbidden");
        assert!(resp.result.message.contains("owner label"));
    }

    #[test]
    fn denied_with_code_overrides_defaults() {
        let resp = denied_with_code(&request(), "quota exceeded", "TooManyRequests", 429);
        assert!(!resp.allowed);
        assert_eq!(resp.result.code, 429);
        assert_eq!(resp.result.reason, "TooManyRequests");
    }

    #[test]
    fn errored_is_internal_error() {
        let resp = errored(&request(), "downstream lookup failed");
        assert!(!resp.allowed);
        assert_eq!(resp.result.code, 500);
        assert_eq!(resp.result.reason, "InternalError");
    }

    #[test]
    fn identical_objects_allow_without_patch() {
        let obj = json!({"metadata": {"labels": {"a": "1"}}});
        let resp = patch_response(&request(), &obj, &obj);
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }

    #[test]
    fn differing_objects_produce_a_patch() {
        let original = json!({"metadata": {"labels": {}}});
        let modified = json!({"metadata": {"labels": {"injected": "true"}}});
        let resp = patch_response(&request(), &original, &modified);
        assert!(resp.allowed);

        let patch_bytes = resp.patch.expect("patch should be attached");
        let patch: serde_json::Value = serde_json::from_slice(&patch_bytes).unwrap();
        let ops = patch.as_array().unwrap();
        assert!(!ops.is_empty());
        assert!(patch.to_string().contains("injected"));
    }
}
