//! kube error -> store error.

use trellis_core::{Error, Gvk, ObjectKey};

pub fn map_err(gvk: &Gvk, key: &ObjectKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound { gvk: gvk.clone(), key: key.clone() },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists { gvk: gvk.clone(), key: key.clone() }
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict { gvk: gvk.clone(), key: key.clone(), message: ae.message },
        other => Error::backend(other),
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{} says no", code), reason: reason.into(), code })
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let key = ObjectKey::new("ns", "a");
        assert!(map_err(&gvk, &key, api(404, "NotFound")).is_not_found());
        assert!(map_err(&gvk, &key, api(409, "AlreadyExists")).is_already_exists());
        let conflict = map_err(&gvk, &key, api(409, "Conflict"));
        assert!(conflict.is_conflict());
        assert!(conflict.to_string().contains("409 says no"));
        assert!(matches!(map_err(&gvk, &key, api(500, "InternalError")), Error::Backend(_)));
        assert!(is_not_found(&api(404, "NotFound")));
        assert!(!is_not_found(&api(403, "Forbidden")));
    }
}
