//! Dependency resolution — run this before executing a workflow.
//!
//! A step's dependencies are its declared `depends_on` list plus every
//! known step its input references (see [`crate::scanner`]).
//!
//! Rules enforced:
//! 1. Step IDs must be unique within the workflow.
//! 2. Every declared dependency must name an existing step.
//! 3. The dependency graph must be acyclic.
//!
//! On success the graph is grouped into execution levels: level *k* holds
//! every step whose dependencies all sit in levels `< k`.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::models::{StepDefinition, Workflow};
use crate::scanner::scan;
use crate::EngineError;

/// A step whose declared and detected dependency sets disagree.
///
/// Detected references are always added to the declared set; this is only
/// surfaced so authors can see both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyConflict {
    pub step_id: String,
    pub declared: BTreeSet<String>,
    pub detected: BTreeSet<String>,
}

/// Validated, acyclic dependency graph over step ids.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Step ids in definition order.
    order: Vec<String>,
    declared: HashMap<String, BTreeSet<String>>,
    detected: HashMap<String, BTreeSet<String>>,
    dependencies: HashMap<String, BTreeSet<String>>,
    levels: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate the graph for `steps`.
    ///
    /// # Errors
    /// - [`EngineError::EmptyWorkflow`] if there are no steps.
    /// - [`EngineError::DuplicateStepId`] if two steps share an ID.
    /// - [`EngineError::UnknownDependency`] if a declared dependency is missing.
    /// - [`EngineError::CyclicDependency`] naming one cycle.
    pub fn build(steps: &[StepDefinition]) -> Result<Self, EngineError> {
        if steps.is_empty() {
            return Err(EngineError::EmptyWorkflow);
        }

        // -------------------------------------------------------------------
        // 1. Ensure step IDs are unique
        // -------------------------------------------------------------------
        let mut known: HashSet<&str> = HashSet::with_capacity(steps.len());
        for step in steps {
            if !known.insert(step.id.as_str()) {
                return Err(EngineError::DuplicateStepId(step.id.clone()));
            }
        }

        // -------------------------------------------------------------------
        // 2. Union declared and detected dependencies
        // -------------------------------------------------------------------
        let mut declared = HashMap::with_capacity(steps.len());
        let mut detected = HashMap::with_capacity(steps.len());
        let mut dependencies = HashMap::with_capacity(steps.len());

        for step in steps {
            let step_declared: BTreeSet<String> = step.depends_on.iter().cloned().collect();
            for dep in &step_declared {
                if !known.contains(dep.as_str()) {
                    return Err(EngineError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            let step_detected = scan(&step.input, &known).ids();
            let union: BTreeSet<String> = step_declared.union(&step_detected).cloned().collect();

            declared.insert(step.id.clone(), step_declared);
            detected.insert(step.id.clone(), step_detected);
            dependencies.insert(step.id.clone(), union);
        }

        let mut graph = Self {
            order: steps.iter().map(|s| s.id.clone()).collect(),
            declared,
            detected,
            dependencies,
            levels: Vec::new(),
        };

        for conflict in graph.conflicts() {
            warn!(
                step_id = %conflict.step_id,
                declared = ?conflict.declared,
                detected = ?conflict.detected,
                "declared and detected dependencies differ; using their union"
            );
        }

        // -------------------------------------------------------------------
        // 3. Level the graph (Kahn's algorithm, one level per round)
        // -------------------------------------------------------------------
        graph.levels = graph.compute_levels()?;
        Ok(graph)
    }

    /// [`build`](Self::build) the workflow's steps and check that its
    /// `return_step`, if any, names one of them.
    pub fn for_workflow(workflow: &Workflow) -> Result<Self, EngineError> {
        let graph = Self::build(&workflow.steps)?;
        if let Some(step_id) = &workflow.options.return_step {
            if !graph.contains(step_id) {
                return Err(EngineError::UnknownReturnStep(step_id.clone()));
            }
        }
        Ok(graph)
    }

    fn compute_levels(&self) -> Result<Vec<Vec<String>>, EngineError> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for id in &self.order {
            let deps = &self.dependencies[id];
            in_degree.insert(id.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut placed = 0usize;
        // Definition order keeps levels deterministic.
        let mut ready: Vec<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        while !ready.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for &id in &ready {
                for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            placed += ready.len();
            levels.push(ready.iter().map(|id| id.to_string()).collect());

            next.sort_by_key(|id| position[id]);
            ready = next;
        }

        // If we didn't place every step the graph contains a cycle.
        if placed != self.order.len() {
            let blocked: HashSet<&str> = in_degree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(&id, _)| id)
                .collect();
            return Err(EngineError::CyclicDependency {
                cycle: self.find_cycle(&blocked),
            });
        }

        Ok(levels)
    }

    /// Every blocked step has a blocked dependency, so following them from
    /// any blocked step must eventually revisit one.
    fn find_cycle(&self, blocked: &HashSet<&str>) -> Vec<String> {
        let Some(start) = self.order.iter().find(|id| blocked.contains(id.as_str())) else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut current = start.as_str();

        loop {
            if let Some(&at) = seen.get(current) {
                // Dependency order walked backwards gives execution order.
                let mut cycle: Vec<String> =
                    path[at..].iter().rev().map(|s| s.to_string()).collect();
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                return cycle;
            }
            seen.insert(current, path.len());
            path.push(current);

            match self.dependencies[current]
                .iter()
                .find(|dep| blocked.contains(dep.as_str()))
            {
                Some(dep) => current = dep.as_str(),
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    /// Execution levels, first to last.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Step ids in definition order.
    pub fn step_ids(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.dependencies.contains_key(step_id)
    }

    /// Union of declared and detected dependencies.
    pub fn dependencies_of(&self, step_id: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(step_id)
    }

    pub fn declared_of(&self, step_id: &str) -> Option<&BTreeSet<String>> {
        self.declared.get(step_id)
    }

    pub fn detected_of(&self, step_id: &str) -> Option<&BTreeSet<String>> {
        self.detected.get(step_id)
    }

    /// Steps that declare dependencies which differ from what their input references.
    pub fn conflicts(&self) -> Vec<DependencyConflict> {
        self.order
            .iter()
            .filter_map(|id| {
                let declared = &self.declared[id];
                let detected = &self.detected[id];
                (!declared.is_empty() && !detected.is_empty() && declared != detected).then(|| {
                    DependencyConflict {
                        step_id: id.clone(),
                        declared: declared.clone(),
                        detected: detected.clone(),
                    }
                })
            })
            .collect()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn make_step(id: &str) -> StepDefinition {
        StepDefinition::new(id, "mock", Value::Null)
    }

    fn level_sets(graph: &DependencyGraph) -> Vec<BTreeSet<String>> {
        graph
            .levels()
            .iter()
            .map(|level| level.iter().cloned().collect())
            .collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn workflow_return_step_must_exist() {
        let steps = vec![make_step("a"), make_step("b").depends_on(&["a"])];

        let ok = Workflow::new("ret", steps.clone()).return_step("a");
        assert!(DependencyGraph::for_workflow(&ok).is_ok());

        let bad = Workflow::new("ret", steps).return_step("z");
        assert!(matches!(
            DependencyGraph::for_workflow(&bad),
            Err(EngineError::UnknownReturnStep(ref id)) if id == "z"
        ));
    }

    #[test]
    fn valid_linear_chain_has_one_step_per_level() {
        // a → b → c
        let graph = DependencyGraph::build(&[
            make_step("a"),
            make_step("b").depends_on(&["a"]),
            make_step("c").depends_on(&["b"]),
        ])
        .expect("should be valid");
        assert_eq!(graph.levels(), &[vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn independent_steps_share_a_level() {
        let graph = DependencyGraph::build(&[
            make_step("a"),
            make_step("b"),
            make_step("c").depends_on(&["a", "b"]),
        ])
        .expect("should be valid");
        assert_eq!(level_sets(&graph), vec![set(&["a", "b"]), set(&["c"])]);
    }

    #[test]
    fn valid_diamond() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let graph = DependencyGraph::build(&[
            make_step("d").depends_on(&["b", "c"]),
            make_step("b").depends_on(&["a"]),
            make_step("c").depends_on(&["a"]),
            make_step("a"),
        ])
        .expect("should be valid");
        assert_eq!(
            level_sets(&graph),
            vec![set(&["a"]), set(&["b", "c"]), set(&["d"])]
        );
    }

    #[test]
    fn references_add_dependencies() {
        let graph = DependencyGraph::build(&[
            make_step("num1"),
            make_step("num2"),
            StepDefinition::new("sum", "calc", json!("${num1.numbers[0]} + ${num2.numbers[0]}")),
        ])
        .expect("should be valid");

        assert_eq!(graph.dependencies_of("sum"), Some(&set(&["num1", "num2"])));
        assert_eq!(level_sets(&graph), vec![set(&["num1", "num2"]), set(&["sum"])]);
    }

    #[test]
    fn unknown_reference_creates_no_dependency() {
        let graph = DependencyGraph::build(&[
            make_step("a"),
            StepDefinition::new("b", "echo", json!("literal ${nope.x}")),
        ])
        .expect("should be valid");
        assert_eq!(level_sets(&graph), vec![set(&["a", "b"])]);
    }

    #[test]
    fn conflicting_sets_are_reported_and_unioned() {
        let graph = DependencyGraph::build(&[
            make_step("a"),
            make_step("b"),
            StepDefinition::new("c", "echo", json!("${b.out}")).depends_on(&["a"]),
        ])
        .expect("should be valid");

        assert_eq!(graph.dependencies_of("c"), Some(&set(&["a", "b"])));
        assert_eq!(
            graph.conflicts(),
            vec![DependencyConflict {
                step_id: "c".into(),
                declared: set(&["a"]),
                detected: set(&["b"]),
            }]
        );
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        assert!(matches!(
            DependencyGraph::build(&[make_step("a"), make_step("a")]),
            Err(EngineError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn unknown_declared_dependency_is_rejected() {
        let result = DependencyGraph::build(&[make_step("a").depends_on(&["ghost"])]);
        assert!(matches!(
            result,
            Err(EngineError::UnknownDependency { step_id, dependency })
                if step_id == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected_and_named() {
        // a → b → c → a
        let result = DependencyGraph::build(&[
            make_step("a").depends_on(&["c"]),
            make_step("b").depends_on(&["a"]),
            make_step("c").depends_on(&["b"]),
            make_step("free"),
        ]);
        let Err(EngineError::CyclicDependency { cycle }) = result else {
            panic!("expected a cycle, got {result:?}");
        };
        assert_eq!(cycle.len(), 4);
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(set(&cycle.iter().map(String::as_str).collect::<Vec<_>>()), set(&["a", "b", "c"]));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let result = DependencyGraph::build(&[StepDefinition::new("a", "echo", json!("${a.x}"))]);
        assert!(matches!(
            result,
            Err(EngineError::CyclicDependency { cycle }) if cycle == vec!["a", "a"]
        ));
    }

    #[test]
    fn empty_workflow_is_rejected() {
        assert!(matches!(DependencyGraph::build(&[]), Err(EngineError::EmptyWorkflow)));
    }

    #[test]
    fn every_step_lands_after_its_dependencies() {
        let steps = vec![
            make_step("e").depends_on(&["d", "a"]),
            make_step("a"),
            make_step("b").depends_on(&["a"]),
            make_step("c"),
            make_step("d").depends_on(&["b", "c"]),
        ];
        let graph = DependencyGraph::build(&steps).expect("valid");
        let level_of: HashMap<&str, usize> = graph
            .levels()
            .iter()
            .enumerate()
            .flat_map(|(i, level)| level.iter().map(move |id| (id.as_str(), i)))
            .collect();

        for step in &steps {
            for dep in graph.dependencies_of(&step.id).unwrap() {
                assert!(level_of[dep.as_str()] < level_of[step.id.as_str()]);
            }
        }
    }
}
