//! Version hashes deciding whether an element has to be processed.
//!
//! All hashes are hex encoded SHA-256 digests over canonical JSON (object
//! keys sorted), so they are stable across processes.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde_json::Value;
use sha2::{Digest, Sha256};

use drover_core::ElementId;

fn digest<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Version of a target spec: what was asked for.
#[must_use]
pub fn object_version(spec: &Value) -> String {
    digest([spec.to_string()])
}

/// Version of a committed output.
#[must_use]
pub fn output_version(output: &Value) -> String {
    digest([output.to_string()])
}

/// Version of the external states bound to an object, keyed by external type.
///
/// Empty without any external state.
#[must_use]
pub fn observed_version(states: &BTreeMap<String, Value>) -> String {
    if states.is_empty() {
        return String::new();
    }
    digest(
        states
            .iter()
            .map(|(kind, state)| format!("{kind}={state}")),
    )
}

/// Version of the inputs of an element from `(link, output version)` pairs.
///
/// Independent of the order of `inputs`. Empty without inputs.
#[must_use]
pub fn input_version<'a, I>(inputs: I) -> String
where
    I: IntoIterator<Item = (&'a ElementId, &'a str)>,
{
    let sorted: BTreeMap<&ElementId, &str> = inputs.into_iter().collect();
    if sorted.is_empty() {
        return String::new();
    }
    digest(sorted.iter().map(|(id, version)| format!("{id}={version}")))
}

/// Tree shaped version combining the object version with the formal
/// versions of the inputs.
#[must_use]
pub fn formal_version<'a, I>(object_version: &str, inputs: I) -> String
where
    I: IntoIterator<Item = (&'a ElementId, &'a str)>,
{
    let sorted: BTreeMap<&ElementId, &str> = inputs.into_iter().collect();
    if sorted.is_empty() {
        return object_version.to_string();
    }
    format!(
        "{object_version}[{}]",
        sorted
            .iter()
            .map(|(id, formal)| format!("{id}={formal}"))
            .join(",")
    )
}

/// Version of a processing result: inputs combined with the object version.
#[must_use]
pub fn effective_version(input_version: &str, object_version: &str) -> String {
    digest([input_version, object_version])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn id(name: &str) -> ElementId {
        ElementId::of("ValueState", "ns", name, "propagate")
    }

    #[test]
    fn test_object_version_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(object_version(&a), object_version(&b));
        assert_ne!(object_version(&a), object_version(&json!({"a": 2, "b": 2})));
        assert_eq!(object_version(&a).len(), 64);
    }

    #[test]
    fn test_empty_inputs_have_empty_versions() {
        assert_eq!(input_version(std::iter::empty()), "");
        assert_eq!(observed_version(&BTreeMap::new()), "");
        assert_eq!(formal_version("abc", std::iter::empty()), "abc");
    }

    #[test]
    fn test_formal_version_lists_inputs_sorted() {
        let (a, b) = (id("a"), id("b"));
        let formal = formal_version("obj", [(&b, "fb"), (&a, "fa")]);
        assert_eq!(
            formal,
            "obj[ValueState/ns/a:propagate=fa,ValueState/ns/b:propagate=fb]"
        );
    }

    #[test]
    fn test_effective_version_depends_on_both_parts() {
        let base = effective_version("in", "obj");
        assert_ne!(base, effective_version("in2", "obj"));
        assert_ne!(base, effective_version("in", "obj2"));
    }

    proptest! {
        #[test]
        fn prop_input_version_is_order_independent(
            entries in proptest::collection::btree_map("[a-z]{1,6}", "[0-9a-f]{8}", 0..8),
            seed in any::<u64>(),
        ) {
            let pairs: Vec<(ElementId, String)> =
                entries.into_iter().map(|(name, v)| (id(&name), v)).collect();
            let mut shuffled = pairs.clone();
            let len = shuffled.len();
            if len > 1 {
                let shift = usize::try_from(seed % len as u64).unwrap();
                shuffled.rotate_left(shift);
                shuffled.reverse();
            }
            let forward = input_version(pairs.iter().map(|(i, v)| (i, v.as_str())));
            let reordered = input_version(shuffled.iter().map(|(i, v)| (i, v.as_str())));
            prop_assert_eq!(forward.is_empty(), pairs.is_empty());
            prop_assert_eq!(forward, reordered);
        }

        #[test]
        fn prop_input_version_changes_with_any_output(
            names in proptest::collection::btree_set("[a-z]{1,6}", 1..6),
            pick in any::<prop::sample::Index>(),
        ) {
            let pairs: Vec<(ElementId, String)> =
                names.iter().map(|name| (id(name), "v1".to_string())).collect();
            let mut changed = pairs.clone();
            let index = pick.index(changed.len());
            if let Some(entry) = changed.get_mut(index) {
                entry.1 = "v2".to_string();
            }
            prop_assert_ne!(
                input_version(pairs.iter().map(|(i, v)| (i, v.as_str()))),
                input_version(changed.iter().map(|(i, v)| (i, v.as_str())))
            );
        }
    }
}
