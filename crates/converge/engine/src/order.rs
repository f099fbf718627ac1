//! Dependency ordering of services

use crate::error::OrderError;
use converge_types::ServiceSpec;
use std::collections::HashSet;

/// Order `specs` so that every service follows its dependencies.
///
/// Stable: independent services keep their configured order.
pub fn dependency_order(specs: &[ServiceSpec]) -> Result<Vec<&ServiceSpec>, OrderError> {
    let mut names = HashSet::new();
    for spec in specs {
        if !names.insert(spec.name.as_str()) {
            return Err(OrderError::DuplicateService(spec.name.clone()));
        }
    }
    for spec in specs {
        if let Some(dependency) = spec.depends_on.iter().find(|d| !names.contains(d.as_str())) {
            return Err(OrderError::UnknownDependency {
                service: spec.name.clone(),
                dependency: dependency.clone(),
            });
        }
    }

    let mut placed: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(specs.len());
    while ordered.len() < specs.len() {
        let next = specs.iter().find(|spec| {
            !placed.contains(spec.name.as_str())
                && spec.depends_on.iter().all(|d| placed.contains(d.as_str()))
        });
        match next {
            Some(spec) => {
                placed.insert(spec.name.as_str());
                ordered.push(spec);
            }
            None => {
                let stuck = specs
                    .iter()
                    .filter(|spec| !placed.contains(spec.name.as_str()))
                    .map(|spec| spec.name.clone())
                    .collect();
                return Err(OrderError::Cycle(stuck));
            }
        }
    }
    Ok(ordered)
}

/// Whether any service after `index` in `ordered` depends on it
pub fn has_dependents(ordered: &[&ServiceSpec], index: usize) -> bool {
    let name = &ordered[index].name;
    ordered[index + 1..]
        .iter()
        .any(|spec| spec.depends_on.iter().any(|d| d == name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, depends_on: &[&str]) -> ServiceSpec {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "namespace": "data",
            "chart_ref": format!("bitnami/{name}"),
            "chart_version": "1.0.0",
            "workload_selector": format!("app={name}"),
            "secret_name": name,
            "depends_on": depends_on
        }))
        .unwrap()
    }

    fn names(ordered: &[&ServiceSpec]) -> Vec<String> {
        ordered.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_dependencies_first_and_stable_otherwise() {
        let specs = vec![
            service("api-cache", &["redis"]),
            service("postgresql", &[]),
            service("redis", &[]),
            service("rabbitmq", &[]),
        ];
        let ordered = dependency_order(&specs).unwrap();
        assert_eq!(names(&ordered), vec!["postgresql", "redis", "api-cache", "rabbitmq"]);
        assert!(has_dependents(&ordered, 1));
        assert!(!has_dependents(&ordered, 0));
    }

    #[test]
    fn test_unknown_dependency() {
        let specs = vec![service("app", &["postgresql"])];
        assert_eq!(
            dependency_order(&specs),
            Err(OrderError::UnknownDependency {
                service: "app".into(),
                dependency: "postgresql".into()
            })
        );
    }

    #[test]
    fn test_cycle_detected() {
        let specs = vec![service("a", &["b"]), service("b", &["a"]), service("c", &[])];
        assert_eq!(
            dependency_order(&specs),
            Err(OrderError::Cycle(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_duplicate_names() {
        let specs = vec![service("a", &[]), service("a", &[])];
        assert_eq!(dependency_order(&specs), Err(OrderError::DuplicateService("a".into())));
    }
}
