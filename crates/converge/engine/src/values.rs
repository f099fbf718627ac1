//! Chart values rendering

use converge_types::{DesiredState, ServiceSpec};
use serde_json::{Map, Value};

/// Render the chart values for a converge.
///
/// Applied in order: image tag, resource requests, persistence size,
/// credentials at their configured paths, then the service's extra values
/// deep-merged on top.
pub fn render_values(spec: &ServiceSpec, desired: &DesiredState) -> Value {
    let mut values = Value::Object(Map::new());

    if let Some(tag) = &desired.target_image_tag {
        set_path(&mut values, "image.tag", Value::String(tag.clone()));
    }
    if let Some(cpu) = &spec.resource_requests.cpu {
        set_path(&mut values, "resources.requests.cpu", Value::String(cpu.clone()));
    }
    if let Some(memory) = &spec.resource_requests.memory {
        set_path(&mut values, "resources.requests.memory", Value::String(memory.clone()));
    }
    if let Some(size) = &spec.persistence_size {
        set_path(&mut values, "persistence.size", Value::String(size.clone()));
    }
    for (key, path) in &spec.credential_value_paths {
        if let Some(secret) = desired.target_secret_values.get(key) {
            set_path(&mut values, path, Value::String(secret.expose().to_string()));
        }
    }

    deep_merge(&mut values, Value::Object(spec.values.clone()));
    values
}

/// Set a dotted path, creating intermediate objects and replacing
/// non-object nodes on the way
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut node = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Merge `overlay` into `base`. Objects merge key by key; anything else in
/// the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_types::{ResourceRequests, SecretMap, SecretValue};
    use serde_json::json;

    fn spec() -> ServiceSpec {
        let mut spec: ServiceSpec = serde_json::from_value(json!({
            "name": "postgresql",
            "namespace": "data",
            "chart_ref": "bitnami/postgresql",
            "chart_version": "15.5.0",
            "workload_selector": "app.kubernetes.io/instance=postgresql",
            "secret_name": "postgresql",
            "credential_keys": ["postgres-password"],
            "persistence_size": "8Gi",
            "credential_value_paths": {"postgres-password": "auth.postgresPassword"},
            "values": {"primary": {"persistence": {"storageClass": "fast"}}, "image": {"pullPolicy": "Always"}}
        }))
        .unwrap();
        spec.resource_requests = ResourceRequests {
            cpu: Some("250m".into()),
            memory: None,
        };
        spec
    }

    fn desired() -> DesiredState {
        DesiredState {
            target_secret_values: SecretMap::from([("postgres-password".to_string(), SecretValue::new("pw"))]),
            target_chart_version: semver::Version::new(15, 5, 0),
            target_image_tag: Some("16.2.0".into()),
            cleanup_mode: false,
            force_install: false,
        }
    }

    #[test]
    fn test_render_values() {
        let values = render_values(&spec(), &desired());
        assert_eq!(
            values,
            json!({
                "image": {"tag": "16.2.0", "pullPolicy": "Always"},
                "resources": {"requests": {"cpu": "250m"}},
                "persistence": {"size": "8Gi"},
                "auth": {"postgresPassword": "pw"},
                "primary": {"persistence": {"storageClass": "fast"}}
            })
        );
    }

    #[test]
    fn test_extra_values_override_rendered_ones() {
        let mut spec = spec();
        spec.values.insert("persistence".into(), json!({"size": "20Gi"}));
        let values = render_values(&spec, &desired());
        assert_eq!(values["persistence"]["size"], "20Gi");
    }

    #[test]
    fn test_set_path_replaces_scalars() {
        let mut root = json!({"image": "busybox"});
        set_path(&mut root, "image.tag", json!("1.36"));
        assert_eq!(root, json!({"image": {"tag": "1.36"}}));
    }
}
