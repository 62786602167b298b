//! Drift detection between virtual objects and their physical projections.
//!
//! Downward equality compares the canonical projection of a virtual object
//! against the live physical object; any difference in the managed field set
//! means the physical side must be rewritten. The delegation annotations are
//! excluded from the comparison on the physical side, since they exist only
//! there by construction.

use crate::delegate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::BTreeMap;

/// Compare two serializable values structurally.
///
/// Used for spec-level comparisons where the adapter declares the whole spec
/// as part of its downward field set.
#[must_use]
pub fn values_equal<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        // Serialization of API objects is infallible in practice; treat a
        // failure as a difference so the writer path re-canonicalizes.
        _ => false,
    }
}

/// Compare the `status` sections of two serialized objects.
#[must_use]
pub fn status_equal<T: Serialize>(a: &T, b: &T) -> bool {
    fn status_of<T: Serialize>(value: &T) -> serde_json::Value {
        serde_json::to_value(value)
            .map(|mut v| v.get_mut("status").map_or(serde_json::Value::Null, serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
    status_of(a) == status_of(b)
}

fn is_delegation_key(key: &str) -> bool {
    key.strip_prefix(delegate::GROUP)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// A map of labels or annotations with the delegation keys removed.
#[must_use]
pub fn without_delegation(map: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.map(|m| {
        m.iter()
            .filter(|(k, _)| !is_delegation_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
    .unwrap_or_default()
}

/// Downward metadata equality between a freshly built projection and the
/// live physical object.
///
/// Labels and annotations must match exactly once the delegation group is
/// stripped from both sides; everything else in the metadata is either
/// server-owned or cleared by projection and therefore not compared.
#[must_use]
pub fn meta_equal(projected: &ObjectMeta, actual: &ObjectMeta) -> bool {
    without_delegation(projected.labels.as_ref()) == without_delegation(actual.labels.as_ref())
        && without_delegation(projected.annotations.as_ref())
            == without_delegation(actual.annotations.as_ref())
}

/// The subset of `keys` whose values differ between `from` and `to`.
///
/// Used for the upward direction, where the adapter declares exactly which
/// labels or annotations flow back to the tenant (by default none from the
/// group that owns the delegation annotations).
#[must_use]
pub fn changed_keys<'a>(
    keys: &'a [&'a str],
    from: Option<&BTreeMap<String, String>>,
    to: Option<&BTreeMap<String, String>>,
) -> Vec<&'a str> {
    keys.iter()
        .filter(|key| {
            let source = from.and_then(|m| m.get(**key));
            let target = to.and_then(|m| m.get(**key));
            source != target
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{delegate::Delegate, ClusterKey};

    fn labelled(labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn delegation_annotations_do_not_count_as_drift() {
        let projected = labelled(&[("app", "web")]);
        let mut actual = labelled(&[("app", "web")]);
        Delegate {
            cluster: ClusterKey::new("vc", "t1", "u"),
            namespace: "default".to_string(),
            uid: "1".to_string(),
        }
        .stamp(&mut actual);
        assert!(meta_equal(&projected, &actual));
    }

    #[test]
    fn label_drift_is_detected() {
        let projected = labelled(&[("app", "web"), ("tier", "front")]);
        let actual = labelled(&[("app", "web")]);
        assert!(!meta_equal(&projected, &actual));
    }

    #[test]
    fn changed_keys_reports_only_differences() {
        let from = labelled(&[("a", "1"), ("b", "2")]);
        let to = labelled(&[("a", "1"), ("b", "other")]);
        assert_eq!(
            changed_keys(&["a", "b", "c"], from.labels.as_ref(), to.labels.as_ref()),
            vec!["b"]
        );
    }

    #[test]
    fn status_sections_compare_structurally() {
        let a = serde_json::json!({"spec": {"x": 1}, "status": {"phase": "Active"}});
        let b = serde_json::json!({"spec": {"x": 2}, "status": {"phase": "Active"}});
        let c = serde_json::json!({"spec": {"x": 1}, "status": {"phase": "Terminating"}});
        assert!(status_equal(&a, &b));
        assert!(!status_equal(&a, &c));
    }
}
