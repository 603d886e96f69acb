use json_patch::Patch;
use serde::Serialize;

use crate::Error;

/// Structural diff of two objects as an RFC 6902 patch.
///
/// Arrays are compared index by index, so an insertion at the front of a list
/// shows up as replaces of the shifted elements plus an add at the tail.
pub fn create_patch<T: Serialize>(before: &T, after: &T) -> Result<Patch, Error> {
    let before = serde_json::to_value(before)?;
    let after = serde_json::to_value(after)?;
    Ok(json_patch::diff(&before, &after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn apply(before: &Value, patch: &Patch) -> Value {
        let mut doc = before.clone();
        json_patch::patch(&mut doc, patch).unwrap();
        doc
    }

    #[test]
    fn identical_objects_produce_empty_patch() {
        let doc = json!({"a": [1, 2, {"b": null}], "c": "d"});
        assert!(create_patch(&doc, &doc).unwrap().0.is_empty());
    }

    #[test]
    fn patch_transforms_before_into_after() {
        let before = json!({
            "spec": {
                "containers": [{"name": "a", "env": [{"name": "X", "value": "1"}]}],
                "initContainers": [{"name": "init"}],
                "nodeName": "old",
            }
        });
        let after = json!({
            "spec": {
                "containers": [{"name": "a", "env": [
                    {"name": "X", "value": "1"},
                    {"name": "HTTP_PROXY", "value": "http://my.proxy.com"},
                ]}],
                "initContainers": [{"name": "setup"}, {"name": "init"}],
                "volumes": [{"name": "ca-certs", "emptyDir": {}}],
            }
        });
        let patch = create_patch(&before, &after).unwrap();
        assert_eq!(apply(&before, &patch), after);
    }

    #[test]
    fn shrinking_list_is_expressed_positionally() {
        let before = json!({"items": ["a", "b", "c"]});
        let after = json!({"items": ["c", "b"]});
        let patch = create_patch(&before, &after).unwrap();
        assert_eq!(apply(&before, &patch), after);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([
                {"op": "replace", "path": "/items/0", "value": "c"},
                {"op": "remove", "path": "/items/2"},
            ])
        );
    }

    #[test]
    fn keys_are_escaped_in_pointers() {
        let before = json!({"metadata": {"labels": {}}});
        let after = json!({"metadata": {"labels": {"some/label": "x", "a~b": "y"}}});
        let patch = create_patch(&before, &after).unwrap();
        let paths: Vec<String> = serde_json::to_value(&patch)
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect();
        assert!(paths.contains(&"/metadata/labels/some~1label".to_string()));
        assert!(paths.contains(&"/metadata/labels/a~0b".to_string()));
        assert_eq!(apply(&before, &patch), after);
    }
}
