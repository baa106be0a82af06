use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::descriptor::{DependencyKind, ServiceDescriptor};
use crate::error::{Error, Result};

/// Ordered startup stages plus the dependency analyses derived while planning.
///
/// Stage index equals the length of the longest required-dependency chain
/// ending at a service, so no service starts before its required dependencies
/// and none is delayed past the earliest stage that satisfies them.
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    /// Service names grouped by stage, in start order. Names within a stage
    /// are sorted; they start concurrently.
    pub stages: Vec<Vec<String>>,

    /// Services that will start against the declared fallback of an absent
    /// optional dependency.
    pub fallback_activations: BTreeMap<String, String>,

    /// Services that will start degraded because an optional dependency is
    /// absent and no fallback is declared.
    pub degraded_starts: Vec<String>,

    /// Runtime dependencies that are not registered, per service. Non-fatal.
    pub missing_runtime: BTreeMap<String, Vec<String>>,
}

impl StagePlan {
    /// The stage index a service is planned into.
    #[must_use]
    pub fn stage_of(&self, name: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|s| s == name))
    }
}

/// One entry of the reverse-dependency index: `dependent` declares an edge to
/// the indexed service.
#[derive(Debug, Clone)]
pub(crate) struct ReverseEdge {
    pub dependent: String,
    pub kind: DependencyKind,
    pub load_bearing: bool,
}

/// Everything the resolver derives from the registered descriptors.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub plan: StagePlan,
    pub depths: HashMap<String, usize>,
    pub reverse: HashMap<String, Vec<ReverseEdge>>,
}

enum Mark {
    OnStack,
    Done,
}

/// Pure stage planning over the registered descriptors.
pub(crate) fn resolve(descriptors: &HashMap<String, ServiceDescriptor>) -> Result<Resolution> {
    // Required edges must target registered services, and a service may not
    // require a target classified below itself without acknowledgment.
    for (name, descriptor) in descriptors {
        for dep in descriptor.dependencies() {
            if dep.kind != DependencyKind::Required {
                continue;
            }
            let Some(target) = descriptors.get(&dep.target) else {
                return Err(Error::UnknownDependency {
                    service: name.clone(),
                    dependency: dep.target.clone(),
                });
            };
            if descriptor.safety_class() > target.safety_class()
                && !dep.class_inversion_acknowledged
            {
                return Err(Error::ClassInversion {
                    service: name.clone(),
                    service_class: descriptor.safety_class(),
                    dependency: dep.target.clone(),
                    dependency_class: target.safety_class(),
                });
            }
        }
    }

    let mut names: Vec<&String> = descriptors.keys().collect();
    names.sort();

    // Cycle detection over required edges only. Sorted traversal keeps the
    // reported cycle deterministic.
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut path: Vec<String> = Vec::new();
    for name in &names {
        if !marks.contains_key(name.as_str()) {
            if let Some(cycle) = find_cycle(name.as_str(), descriptors, &mut marks, &mut path) {
                return Err(Error::DependencyCycle { cycle });
            }
        }
    }

    // Depth of a service = 1 + max depth of its required dependencies.
    let mut depths: HashMap<String, usize> = HashMap::new();
    for name in &names {
        depth_of(name.as_str(), descriptors, &mut depths);
    }
    let stage_count = depths.values().copied().max().map_or(0, |d| d + 1);
    let mut stages: Vec<Vec<String>> = vec![Vec::new(); stage_count];
    for name in &names {
        let depth = depths.get(name.as_str()).copied().unwrap_or(0);
        if let Some(stage) = stages.get_mut(depth) {
            stage.push((*name).clone());
        }
    }

    // Reverse index over every edge kind, reused for health propagation and
    // dependent-impact analysis.
    let mut reverse: HashMap<String, Vec<ReverseEdge>> = HashMap::new();
    for (name, descriptor) in descriptors {
        for dep in descriptor.dependencies() {
            if descriptors.contains_key(&dep.target) {
                reverse.entry(dep.target.clone()).or_default().push(ReverseEdge {
                    dependent: name.clone(),
                    kind: dep.kind,
                    load_bearing: dep.load_bearing,
                });
            }
        }
    }
    for edges in reverse.values_mut() {
        edges.sort_by(|a, b| a.dependent.cmp(&b.dependent));
    }

    // Absent optional targets select the fallback path or a degraded start;
    // absent runtime targets only feed the post-startup report.
    let mut fallback_activations: BTreeMap<String, String> = BTreeMap::new();
    let mut degraded_starts: BTreeSet<String> = BTreeSet::new();
    let mut missing_runtime: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &names {
        let Some(descriptor) = descriptors.get(name.as_str()) else {
            continue;
        };
        for dep in descriptor.dependencies() {
            if descriptors.contains_key(&dep.target) {
                continue;
            }
            match dep.kind {
                DependencyKind::Required => {}
                DependencyKind::Optional => {
                    let fallback = dep
                        .fallback
                        .as_deref()
                        .filter(|f| descriptors.contains_key(*f));
                    if let Some(fallback) = fallback {
                        fallback_activations.insert((*name).clone(), fallback.to_string());
                    } else {
                        degraded_starts.insert((*name).clone());
                    }
                }
                DependencyKind::Runtime => missing_runtime
                    .entry((*name).clone())
                    .or_default()
                    .push(dep.target.clone()),
            }
        }
    }

    Ok(Resolution {
        plan: StagePlan {
            stages,
            fallback_activations,
            degraded_starts: degraded_starts.into_iter().collect(),
            missing_runtime,
        },
        depths,
        reverse,
    })
}

fn required_targets<'a>(
    name: &str,
    descriptors: &'a HashMap<String, ServiceDescriptor>,
) -> Vec<&'a str> {
    let mut targets: Vec<&str> = descriptors
        .get(name)
        .map(ServiceDescriptor::dependencies)
        .unwrap_or_default()
        .iter()
        .filter(|d| d.kind == DependencyKind::Required)
        .map(|d| d.target.as_str())
        .collect();
    targets.sort_unstable();
    targets
}

fn find_cycle(
    name: &str,
    descriptors: &HashMap<String, ServiceDescriptor>,
    marks: &mut HashMap<String, Mark>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    marks.insert(name.to_string(), Mark::OnStack);
    path.push(name.to_string());
    for target in required_targets(name, descriptors) {
        match marks.get(target) {
            Some(Mark::Done) => {}
            Some(Mark::OnStack) => {
                let start = path.iter().position(|p| p == target).unwrap_or(0);
                let mut cycle: Vec<String> = path.get(start..).unwrap_or_default().to_vec();
                cycle.push(target.to_string());
                return Some(cycle);
            }
            None => {
                if let Some(cycle) = find_cycle(target, descriptors, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }
    path.pop();
    marks.insert(name.to_string(), Mark::Done);
    None
}

fn depth_of(
    name: &str,
    descriptors: &HashMap<String, ServiceDescriptor>,
    memo: &mut HashMap<String, usize>,
) -> usize {
    if let Some(depth) = memo.get(name) {
        return *depth;
    }
    let depth = required_targets(name, descriptors)
        .into_iter()
        .map(|target| depth_of(target, descriptors, memo) + 1)
        .max()
        .unwrap_or(0);
    memo.insert(name.to_string(), depth);
    depth
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use coach_bootable::Bootable;

    use super::*;
    use crate::descriptor::{Dependency, SafetyClass, ServiceDescriptorOptions};

    struct Noop;

    #[async_trait]
    impl Bootable for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn start(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }

        async fn shutdown(
            &self,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn descriptor(
        name: &str,
        safety_class: SafetyClass,
        dependencies: Vec<Dependency>,
    ) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceDescriptorOptions {
            name: name.to_string(),
            body: Arc::new(Noop),
            dependencies,
            tags: Vec::new(),
            safety_class,
            description: String::new(),
            heartbeat: None,
        })
    }

    fn registry(descriptors: Vec<ServiceDescriptor>) -> HashMap<String, ServiceDescriptor> {
        descriptors
            .into_iter()
            .map(|d| (d.name().to_string(), d))
            .collect()
    }

    #[test]
    fn test_linear_chain_stages() {
        let resolution = resolve(&registry(vec![
            descriptor("config", SafetyClass::Critical, Vec::new()),
            descriptor(
                "database",
                SafetyClass::Critical,
                vec![Dependency::required("config")],
            ),
            descriptor(
                "entity-service",
                SafetyClass::Critical,
                vec![Dependency::required("database")],
            ),
        ]))
        .unwrap();

        assert_eq!(
            resolution.plan.stages,
            vec![
                vec!["config".to_string()],
                vec!["database".to_string()],
                vec!["entity-service".to_string()],
            ]
        );
    }

    #[test]
    fn test_diamond_maximizes_parallelism() {
        let resolution = resolve(&registry(vec![
            descriptor("a", SafetyClass::Operational, Vec::new()),
            descriptor(
                "b",
                SafetyClass::Operational,
                vec![Dependency::required("a")],
            ),
            descriptor(
                "c",
                SafetyClass::Operational,
                vec![Dependency::required("a")],
            ),
            descriptor(
                "d",
                SafetyClass::Operational,
                vec![Dependency::required("b"), Dependency::required("c")],
            ),
        ]))
        .unwrap();

        assert_eq!(
            resolution.plan.stages,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn test_required_dependency_stage_strictly_earlier() {
        let resolution = resolve(&registry(vec![
            descriptor("a", SafetyClass::Operational, Vec::new()),
            descriptor(
                "b",
                SafetyClass::Operational,
                vec![Dependency::required("a")],
            ),
            descriptor(
                "c",
                SafetyClass::Operational,
                vec![Dependency::required("a"), Dependency::required("b")],
            ),
        ]))
        .unwrap();

        let plan = &resolution.plan;
        for (name, deps) in [("b", vec!["a"]), ("c", vec!["a", "b"])] {
            for dep in deps {
                assert!(plan.stage_of(dep).unwrap() < plan.stage_of(name).unwrap());
            }
        }
    }

    #[test]
    fn test_required_cycle_is_reported_in_edge_order() {
        let err = resolve(&registry(vec![
            descriptor(
                "a",
                SafetyClass::Operational,
                vec![Dependency::required("b")],
            ),
            descriptor(
                "b",
                SafetyClass::Operational,
                vec![Dependency::required("c")],
            ),
            descriptor(
                "c",
                SafetyClass::Operational,
                vec![Dependency::required("a")],
            ),
        ]))
        .unwrap_err();

        match err {
            Error::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unregistered_required_dependency_is_rejected() {
        let err = resolve(&registry(vec![descriptor(
            "a",
            SafetyClass::Operational,
            vec![Dependency::required("ghost")],
        )]))
        .unwrap_err();

        assert!(matches!(
            err,
            Error::UnknownDependency { service, dependency }
                if service == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_absent_optional_selects_fallback_or_degraded_start() {
        let resolution = resolve(&registry(vec![
            descriptor("memory-cache", SafetyClass::Operational, Vec::new()),
            descriptor(
                "entity-service",
                SafetyClass::Operational,
                vec![Dependency::optional("cache").with_fallback("memory-cache")],
            ),
            descriptor(
                "dashboard",
                SafetyClass::Operational,
                vec![Dependency::optional("cache")],
            ),
        ]))
        .unwrap();

        assert_eq!(
            resolution.plan.fallback_activations.get("entity-service"),
            Some(&"memory-cache".to_string())
        );
        assert_eq!(resolution.plan.degraded_starts, vec!["dashboard"]);
        // Optional edges never affect placement.
        assert_eq!(resolution.plan.stage_of("entity-service"), Some(0));
    }

    #[test]
    fn test_runtime_dependencies_do_not_gate_stages() {
        let resolution = resolve(&registry(vec![descriptor(
            "websocket",
            SafetyClass::Operational,
            vec![Dependency::runtime("metrics")],
        )]))
        .unwrap();

        assert_eq!(resolution.plan.stage_of("websocket"), Some(0));
        assert_eq!(
            resolution.plan.missing_runtime.get("websocket"),
            Some(&vec!["metrics".to_string()])
        );
    }

    #[test]
    fn test_optional_cycle_is_not_an_error() {
        let resolution = resolve(&registry(vec![
            descriptor(
                "a",
                SafetyClass::Operational,
                vec![Dependency::optional("b")],
            ),
            descriptor(
                "b",
                SafetyClass::Operational,
                vec![Dependency::optional("a")],
            ),
        ]))
        .unwrap();

        assert_eq!(resolution.plan.stages, vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_class_inversion_requires_acknowledgment() {
        let err = resolve(&registry(vec![
            descriptor("logger", SafetyClass::Operational, Vec::new()),
            descriptor(
                "can-bus",
                SafetyClass::Critical,
                vec![Dependency::required("logger")],
            ),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::ClassInversion { .. }));

        resolve(&registry(vec![
            descriptor("logger", SafetyClass::Operational, Vec::new()),
            descriptor(
                "can-bus",
                SafetyClass::Critical,
                vec![Dependency::required("logger").acknowledge_class_inversion()],
            ),
        ]))
        .unwrap();
    }

    #[test]
    fn test_reverse_index_covers_all_edge_kinds() {
        let resolution = resolve(&registry(vec![
            descriptor("core", SafetyClass::Operational, Vec::new()),
            descriptor(
                "a",
                SafetyClass::Operational,
                vec![Dependency::required("core")],
            ),
            descriptor(
                "b",
                SafetyClass::Operational,
                vec![Dependency::optional("core")],
            ),
            descriptor(
                "c",
                SafetyClass::Operational,
                vec![Dependency::runtime("core")],
            ),
        ]))
        .unwrap();

        let dependents: Vec<&str> = resolution.reverse["core"]
            .iter()
            .map(|e| e.dependent.as_str())
            .collect();
        assert_eq!(dependents, vec!["a", "b", "c"]);
    }
}
