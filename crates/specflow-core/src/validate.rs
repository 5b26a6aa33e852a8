//! Workflow validation.
//!
//! Structural checks over a parsed workflow: required fields, reference
//! integrity, uniqueness, cycle detection, and spec-folder existence.
//! Every defect is collected and returned, so operators fix a workflow in
//! one pass instead of replaying the validator error by error.

use crate::graph::DepGraph;
use crate::workflow::{parse_duration, NodeInfo, ParseResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A single validation defect with its source location where known.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{path}: missing required field `{field}`{}", fmt_loc(.location))]
    MissingField {
        path: String,
        field: &'static str,
        location: Option<NodeInfo>,
    },

    #[error("duplicate layer id `{id}`{}{}", fmt_loc(.location), fmt_second(.first_declared))]
    DuplicateLayer {
        id: String,
        location: Option<NodeInfo>,
        first_declared: Option<NodeInfo>,
    },

    #[error("layer `{layer_id}` depends on unknown layer `{reference}` (valid layers: {})", .valid.join(", "))]
    InvalidLayerRef {
        layer_id: String,
        reference: String,
        valid: Vec<String>,
        location: Option<NodeInfo>,
    },

    #[error("duplicate feature id `{id}`{}{}", fmt_loc(.location), fmt_second(.first_declared))]
    DuplicateFeature {
        id: String,
        location: Option<NodeInfo>,
        first_declared: Option<NodeInfo>,
    },

    #[error("feature `{feature_id}` depends on unknown feature `{reference}`{}", fmt_loc(.location))]
    InvalidFeatureRef {
        feature_id: String,
        reference: String,
        location: Option<NodeInfo>,
    },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("feature `{feature_id}` has no spec folder at {}{}", .expected.display(), fmt_loc(.location))]
    MissingSpecFolder {
        feature_id: String,
        expected: PathBuf,
        location: Option<NodeInfo>,
    },

    #[error("feature `{feature_id}` has invalid timeout `{value}`: {reason}{}", fmt_loc(.location))]
    InvalidTimeout {
        feature_id: String,
        value: String,
        reason: String,
        location: Option<NodeInfo>,
    },
}

fn fmt_loc(location: &Option<NodeInfo>) -> String {
    location.map_or_else(String::new, |l| format!(" (line {}, column {})", l.line, l.column))
}

fn fmt_second(location: &Option<NodeInfo>) -> String {
    location.map_or_else(String::new, |l| {
        format!(", previously declared at line {}, column {}", l.line, l.column)
    })
}

/// Validation options.
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Directory holding one spec folder per feature id. When set, every
    /// feature id must map to an existing directory underneath it.
    pub specs_dir: Option<PathBuf>,
}

/// Validate a parsed workflow, returning every defect found.
pub fn validate(parsed: &ParseResult, options: &ValidateOptions) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let wf = &parsed.workflow;
    let loc = |path: &str| parsed.location(path);

    if wf.schema_version.is_empty() {
        errors.push(ValidationError::MissingField {
            path: "schema_version".to_string(),
            field: "schema_version",
            location: loc("schema_version"),
        });
    }
    if wf.dag.name.is_empty() {
        errors.push(ValidationError::MissingField {
            path: "dag.name".to_string(),
            field: "name",
            location: loc("dag").or_else(|| loc("dag.name")),
        });
    }

    // Layer ids: required and unique.
    let mut layer_locations: BTreeMap<&str, NodeInfo> = BTreeMap::new();
    let valid_layers: Vec<String> = wf
        .layers
        .iter()
        .filter(|l| !l.id.is_empty())
        .map(|l| l.id.clone())
        .collect();

    for (i, layer) in wf.layers.iter().enumerate() {
        let layer_path = format!("layers[{i}]");
        if layer.id.is_empty() {
            errors.push(ValidationError::MissingField {
                path: layer_path.clone(),
                field: "id",
                location: loc(&layer_path),
            });
            continue;
        }
        let id_loc = loc(&format!("{layer_path}.id"));
        if let Some(first) = layer_locations.get(layer.id.as_str()) {
            errors.push(ValidationError::DuplicateLayer {
                id: layer.id.clone(),
                location: id_loc,
                first_declared: Some(*first),
            });
        } else if let Some(info) = id_loc {
            layer_locations.insert(&layer.id, info);
        }

        for (d, dep) in layer.depends_on.iter().enumerate() {
            if !valid_layers.contains(dep) {
                errors.push(ValidationError::InvalidLayerRef {
                    layer_id: layer.id.clone(),
                    reference: dep.clone(),
                    valid: valid_layers.clone(),
                    location: loc(&format!("{layer_path}.depends_on[{d}]"))
                        .or_else(|| loc(&format!("{layer_path}.depends_on"))),
                });
            }
        }
    }

    // Feature ids: required, globally unique; descriptions required.
    let mut feature_locations: BTreeMap<&str, NodeInfo> = BTreeMap::new();
    let mut feature_paths: BTreeMap<&str, String> = BTreeMap::new();
    for (i, layer) in wf.layers.iter().enumerate() {
        for (j, feature) in layer.features.iter().enumerate() {
            let feature_path = format!("layers[{i}].features[{j}]");
            if feature.id.is_empty() {
                errors.push(ValidationError::MissingField {
                    path: feature_path.clone(),
                    field: "id",
                    location: loc(&feature_path),
                });
                continue;
            }
            let id_loc = loc(&format!("{feature_path}.id"));
            if let Some(first) = feature_locations.get(feature.id.as_str()) {
                errors.push(ValidationError::DuplicateFeature {
                    id: feature.id.clone(),
                    location: id_loc,
                    first_declared: Some(*first),
                });
            } else {
                if let Some(info) = id_loc {
                    feature_locations.insert(&feature.id, info);
                }
                feature_paths.insert(&feature.id, feature_path.clone());
            }

            if feature.description.is_empty() {
                errors.push(ValidationError::MissingField {
                    path: feature_path.clone(),
                    field: "description",
                    location: loc(&feature_path),
                });
            }

            if let Some(timeout) = &feature.timeout {
                if let Err(reason) = parse_duration(timeout) {
                    errors.push(ValidationError::InvalidTimeout {
                        feature_id: feature.id.clone(),
                        value: timeout.clone(),
                        reason,
                        location: loc(&format!("{feature_path}.timeout")),
                    });
                }
            }
        }
    }

    // Feature dependency references.
    for (i, layer) in wf.layers.iter().enumerate() {
        for (j, feature) in layer.features.iter().enumerate() {
            if feature.id.is_empty() {
                continue;
            }
            let feature_path = format!("layers[{i}].features[{j}]");
            for (d, dep) in feature.depends_on.iter().enumerate() {
                if !feature_locations.contains_key(dep.as_str()) {
                    errors.push(ValidationError::InvalidFeatureRef {
                        feature_id: feature.id.clone(),
                        reference: dep.clone(),
                        location: loc(&format!("{feature_path}.depends_on[{d}]"))
                            .or_else(|| loc(&format!("{feature_path}.depends_on"))),
                    });
                }
            }
        }
    }

    // Cycle detection over the feature dependency graph. Only run when
    // references resolve, so a dangling edge is reported once, not twice.
    let graph = DepGraph::from_workflow(wf);
    if let Some(path) = graph.find_cycle() {
        errors.push(ValidationError::Cycle { path });
    }

    // Spec folder existence.
    if let Some(specs_dir) = &options.specs_dir {
        for feature in wf.features() {
            if feature.id.is_empty() {
                continue;
            }
            let expected = specs_dir.join(&feature.id);
            if !expected.is_dir() {
                let feature_path = feature_paths.get(feature.id.as_str());
                errors.push(ValidationError::MissingSpecFolder {
                    feature_id: feature.id.clone(),
                    expected,
                    location: feature_path.and_then(|p| loc(&format!("{p}.id"))),
                });
            }
        }
    }

    errors
}
