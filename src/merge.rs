use serde_json::Value;

/// Recursive merge of two JSON trees, used for manifest overlays.
///
/// Maps merge key by key; an explicit `null` in the overlay removes the
/// field from the result. Every other overlay node (scalar or list)
/// replaces the base node wholesale.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut result = base_map.clone();
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    result.remove(key);
                    continue;
                }
                let merged = match result.get(key) {
                    Some(base_value) => merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                result.insert(key.clone(), merged);
            }
            Value::Object(result)
        }
        (_, overlay) => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_maps_merge_key_by_key() {
        let base = json!({"spec": {"replicas": 1, "selector": {"app": "web"}}});
        let overlay = json!({"spec": {"replicas": 3}});
        let merged = merge(&base, &overlay);
        assert_eq!(merged, json!({"spec": {"replicas": 3, "selector": {"app": "web"}}}));
    }

    #[test]
    fn null_removes_the_field() {
        let base = json!({"metadata": {"labels": {"a": "1"}, "annotations": {"x": "y"}}});
        let overlay = json!({"metadata": {"annotations": null}});
        let merged = merge(&base, &overlay);
        assert_eq!(merged, json!({"metadata": {"labels": {"a": "1"}}}));
    }

    #[test]
    fn lists_replace_wholesale() {
        let base = json!({"containers": [{"name": "a"}, {"name": "b"}]});
        let overlay = json!({"containers": [{"name": "c"}]});
        let merged = merge(&base, &overlay);
        assert_eq!(merged, json!({"containers": [{"name": "c"}]}));
    }
}
