//! Instruction-set parsing.
//!
//! Stored instruction text is either a structured KDL pipeline or a flat
//! shell script. Text that does not parse as KDL, or parses but declares no
//! stages, is treated as a flat script; the stage scheduler expands those
//! into a single-stage pipeline.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use std::time::Duration;
use veribuild_core::stage::DEFAULT_STAGE_TIMEOUT;
use veribuild_core::{InstructionSet, ResourceNeeds, Stage};

/// Parse instruction text into an [`InstructionSet`].
///
/// Only structural errors inside an explicitly structured pipeline are
/// reported; anything that is not a structured pipeline falls back to the
/// flat-script form.
pub fn parse_instruction_set(text: &str) -> ConfigResult<InstructionSet> {
    let doc: KdlDocument = match text.parse() {
        Ok(doc) => doc,
        Err(_) => return Ok(InstructionSet::Script(text.to_string())),
    };

    let has_pipeline = doc.nodes().iter().any(|n| n.name().value() == "pipeline");
    let has_stages = doc.nodes().iter().any(|n| n.name().value() == "stage");
    if !has_pipeline || !has_stages {
        return Ok(InstructionSet::Script(text.to_string()));
    }

    let mut stages = Vec::new();
    for node in doc.nodes() {
        if node.name().value() == "stage" {
            stages.push(parse_stage(node)?);
        }
    }

    // Early structural checks. The scheduler re-validates (including cycle
    // detection) when it compiles the graph.
    let mut seen: Vec<&str> = Vec::new();
    for stage in &stages {
        if seen.contains(&stage.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
        }
        seen.push(&stage.name);
    }
    for stage in &stages {
        for dep in &stage.depends_on {
            if !seen.contains(&dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.name, dep
                )));
            }
        }
    }

    Ok(InstructionSet::Pipeline(stages))
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let depends_on = get_string_list_prop(node, "depends");
    let parallel_group = get_string_prop(node, "group");

    let mut commands = Vec::new();
    let mut resources = ResourceNeeds::default();
    let mut retry_count = 0u32;
    let mut timeout = DEFAULT_STAGE_TIMEOUT;
    let mut artifacts = Vec::new();
    let mut cache_paths = Vec::new();
    let mut env = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "retries" => {
                    let v = get_first_int_arg(child).unwrap_or(0);
                    if v < 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "retries".to_string(),
                            message: format!("must not be negative, got {v}"),
                        });
                    }
                    retry_count = v as u32;
                }
                "timeout" => {
                    let secs = get_first_int_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("timeout seconds for stage '{name}'"))
                    })?;
                    if secs <= 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "timeout".to_string(),
                            message: format!("must be positive, got {secs}"),
                        });
                    }
                    timeout = Duration::from_secs(secs as u64);
                }
                "resources" => {
                    resources = parse_resources(child)?;
                }
                "artifacts" => {
                    artifacts.extend(get_all_string_args(child));
                }
                "cache" => {
                    cache_paths.extend(get_all_string_args(child));
                }
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = get_first_string_arg(gc) {
                                env.push((key, val));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for stage '{name}'"
        )));
    }

    Ok(Stage {
        name,
        commands,
        depends_on,
        parallel_group,
        resources,
        retry_count,
        timeout,
        artifacts,
        cache_paths,
        env,
    })
}

fn parse_resources(node: &KdlNode) -> ConfigResult<ResourceNeeds> {
    let defaults = ResourceNeeds::default();
    Ok(ResourceNeeds {
        cpu_cores: non_negative_prop(node, "cpu", defaults.cpu_cores as i64)? as u32,
        memory_mb: non_negative_prop(node, "memory-mb", defaults.memory_mb as i64)? as u64,
        storage_mb: non_negative_prop(node, "storage-mb", defaults.storage_mb as i64)? as u64,
        cycle_budget: non_negative_prop(node, "cycles", defaults.cycle_budget as i64)? as u64,
    })
}

/// Integer prop that must not be negative; values are cast to unsigned
/// fields after this check.
fn non_negative_prop(node: &KdlNode, name: &str, default: i64) -> ConfigResult<i64> {
    let v = get_int_prop(node, name).unwrap_or(default);
    if v < 0 {
        return Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("must not be negative, got {v}"),
        });
    }
    Ok(v)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .map(|v| v as i64)
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i64> {
    node.get(name).and_then(|v| v.as_integer()).map(|v| v as i64)
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    // Repeated attributes: depends="a" depends="b"
    let mut result = Vec::new();
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }
    if !result.is_empty() {
        return result;
    }

    // Block syntax: depends { "a"; "b" }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}
