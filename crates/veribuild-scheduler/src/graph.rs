//! Stage dependency graph compilation.
//!
//! Validates a stage list and resolves it into ordered execution batches:
//! batch 0 holds stages with no dependencies, and a stage joins the minimum
//! batch k where all of its dependencies sit in batches below k.

use std::collections::HashMap;
use veribuild_core::{Error, Result, Stage};

/// Stages within one batch that may run concurrently against each other.
///
/// Stages sharing a `parallel_group` value form one multi-stage group;
/// ungrouped stages become singleton groups and run sequentially relative
/// to their batch siblings.
#[derive(Debug, Clone)]
pub struct StageGroup {
    pub parallel_group: Option<String>,
    pub stages: Vec<String>,
}

/// One topological layer of the pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    pub index: usize,
    pub groups: Vec<StageGroup>,
}

impl ExecutionBatch {
    /// Stage names in this batch, group order then declaration order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|g| g.stages.iter().map(String::as_str))
    }
}

/// An immutable, validated stage DAG for one pipeline run.
#[derive(Debug)]
pub struct PipelineGraph {
    stages: HashMap<String, Stage>,
    batches: Vec<ExecutionBatch>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

impl PipelineGraph {
    /// Compile a stage list into ordered execution batches.
    ///
    /// Rejects duplicate stage names, references to unknown stages,
    /// non-positive timeouts, and dependency cycles.
    pub fn compile(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::InvalidInput("pipeline has no stages".into()));
        }

        let mut by_name: HashMap<String, Stage> = HashMap::new();
        for stage in &stages {
            if stage.timeout.is_zero() {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' has a zero timeout",
                    stage.name
                )));
            }
            if by_name.insert(stage.name.clone(), stage.clone()).is_some() {
                return Err(Error::InvalidInput(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }
        for stage in &stages {
            for dep in &stage.depends_on {
                if !by_name.contains_key(dep) {
                    return Err(Error::InvalidInput(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    )));
                }
            }
        }

        Self::check_acyclic(&stages)?;
        let batches = Self::assign_batches(&stages);

        Ok(Self {
            stages: by_name,
            batches,
        })
    }

    pub fn batches(&self) -> &[ExecutionBatch] {
        &self.batches
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Cycle detection by depth-first traversal with three-color marking.
    /// A back-edge into an in-progress stage signals a cycle.
    fn check_acyclic(stages: &[Stage]) -> Result<()> {
        let by_name: HashMap<&str, &Stage> =
            stages.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut colors: HashMap<&str, Color> = stages
            .iter()
            .map(|s| (s.name.as_str(), Color::Unvisited))
            .collect();

        for stage in stages {
            if colors[stage.name.as_str()] == Color::Unvisited {
                Self::visit(stage.name.as_str(), &by_name, &mut colors)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a Stage>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> Result<()> {
        colors.insert(name, Color::InProgress);
        for dep in &by_name[name].depends_on {
            match colors[dep.as_str()] {
                Color::InProgress => {
                    return Err(Error::InvalidInput(format!(
                        "dependency cycle detected: '{name}' -> '{dep}'"
                    )));
                }
                Color::Unvisited => Self::visit(dep.as_str(), by_name, colors)?,
                Color::Done => {}
            }
        }
        colors.insert(name, Color::Done);
        Ok(())
    }

    /// Assign each stage the minimum batch index greater than all of its
    /// dependencies' indices, then split each batch into parallel groups.
    fn assign_batches(stages: &[Stage]) -> Vec<ExecutionBatch> {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        // Acyclicity is already established, so repeated passes settle.
        while levels.len() < stages.len() {
            for stage in stages {
                if levels.contains_key(stage.name.as_str()) {
                    continue;
                }
                let mut level = 0;
                let mut ready = true;
                for dep in &stage.depends_on {
                    match levels.get(dep.as_str()) {
                        Some(l) => level = level.max(l + 1),
                        None => {
                            ready = false;
                            break;
                        }
                    }
                }
                if ready {
                    levels.insert(stage.name.as_str(), level);
                }
            }
        }

        let batch_count = levels.values().copied().max().unwrap_or(0) + 1;
        let mut batches = Vec::with_capacity(batch_count);
        for index in 0..batch_count {
            // Declaration order within a batch, groups in order of first
            // appearance.
            let mut groups: Vec<StageGroup> = Vec::new();
            for stage in stages.iter().filter(|s| levels[s.name.as_str()] == index) {
                let slot = stage.parallel_group.as_ref().and_then(|g| {
                    groups
                        .iter_mut()
                        .find(|existing| existing.parallel_group.as_ref() == Some(g))
                });
                match slot {
                    Some(group) => group.stages.push(stage.name.clone()),
                    None => groups.push(StageGroup {
                        parallel_group: stage.parallel_group.clone(),
                        stages: vec![stage.name.clone()],
                    }),
                }
            }
            batches.push(ExecutionBatch { index, groups });
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, deps: Vec<&str>) -> Stage {
        let mut s = Stage::script(name, vec![format!("echo {name}")]);
        s.depends_on = deps.into_iter().map(String::from).collect();
        s
    }

    fn grouped(name: &str, deps: Vec<&str>, group: &str) -> Stage {
        let mut s = stage(name, deps);
        s.parallel_group = Some(group.to_string());
        s
    }

    fn batch_of(graph: &PipelineGraph, name: &str) -> usize {
        graph
            .batches()
            .iter()
            .find(|b| b.stage_names().any(|s| s == name))
            .map(|b| b.index)
            .unwrap()
    }

    #[test]
    fn test_diamond_batches() {
        let graph = PipelineGraph::compile(vec![
            stage("fetch", vec![]),
            stage("build-a", vec!["fetch"]),
            stage("build-b", vec!["fetch"]),
            stage("package", vec!["build-a", "build-b"]),
        ])
        .unwrap();

        assert_eq!(graph.batches().len(), 3);
        assert_eq!(batch_of(&graph, "fetch"), 0);
        assert_eq!(batch_of(&graph, "build-a"), 1);
        assert_eq!(batch_of(&graph, "build-b"), 1);
        assert_eq!(batch_of(&graph, "package"), 2);
    }

    #[test]
    fn test_topological_order_respects_all_edges() {
        // A longer chain with cross links; every dependency must land in a
        // strictly earlier batch.
        let stages = vec![
            stage("a", vec![]),
            stage("b", vec!["a"]),
            stage("c", vec!["a"]),
            stage("d", vec!["b", "c"]),
            stage("e", vec!["c"]),
            stage("f", vec!["d", "e"]),
        ];
        let graph = PipelineGraph::compile(stages.clone()).unwrap();

        for s in &stages {
            for dep in &s.depends_on {
                assert!(
                    batch_of(&graph, dep) < batch_of(&graph, &s.name),
                    "{dep} must precede {}",
                    s.name
                );
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let result = PipelineGraph::compile(vec![
            stage("a", vec!["b"]),
            stage("b", vec!["c"]),
            stage("c", vec!["a"]),
        ]);
        assert!(matches!(result, Err(Error::InvalidInput(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = PipelineGraph::compile(vec![stage("a", vec!["a"])]);
        assert!(matches!(result, Err(Error::InvalidInput(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = PipelineGraph::compile(vec![stage("a", vec!["ghost"])]);
        assert!(matches!(result, Err(Error::InvalidInput(msg)) if msg.contains("ghost")));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = PipelineGraph::compile(vec![stage("a", vec![]), stage("a", vec![])]);
        assert!(matches!(result, Err(Error::InvalidInput(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut s = stage("a", vec![]);
        s.timeout = std::time::Duration::ZERO;
        assert!(matches!(
            PipelineGraph::compile(vec![s]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(matches!(
            PipelineGraph::compile(vec![]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parallel_groups_merge_within_batch() {
        let graph = PipelineGraph::compile(vec![
            stage("fetch", vec![]),
            grouped("test-unit", vec!["fetch"], "tests"),
            grouped("test-int", vec!["fetch"], "tests"),
            stage("lint", vec!["fetch"]),
        ])
        .unwrap();

        let batch = &graph.batches()[1];
        assert_eq!(batch.groups.len(), 2);

        let tests = batch
            .groups
            .iter()
            .find(|g| g.parallel_group.as_deref() == Some("tests"))
            .unwrap();
        assert_eq!(tests.stages, vec!["test-unit", "test-int"]);

        let lint = batch
            .groups
            .iter()
            .find(|g| g.parallel_group.is_none())
            .unwrap();
        assert_eq!(lint.stages, vec!["lint"]);
    }

    #[test]
    fn test_same_group_across_batches_stays_split() {
        // Group membership only applies within one batch; a dependent stage
        // with the same group lands in a later batch.
        let graph = PipelineGraph::compile(vec![
            grouped("first", vec![], "g"),
            grouped("second", vec!["first"], "g"),
        ])
        .unwrap();
        assert_eq!(graph.batches().len(), 2);
        assert_eq!(batch_of(&graph, "first"), 0);
        assert_eq!(batch_of(&graph, "second"), 1);
    }
}
