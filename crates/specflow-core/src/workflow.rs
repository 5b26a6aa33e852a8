//! Workflow document schema and parser.
//!
//! Parses a YAML workflow into typed config plus a `NodeInfo` table that
//! maps dotted node paths (`layers[1].features[0].id`) to source
//! locations. Kind mismatches surface as `expected mapping/sequence at
//! <path>` with line/column attached; missing required fields are left
//! empty for the validator to report, so one pass can collect every
//! defect.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Source location of a workflow node (1-based line and column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub line: usize,
    pub column: usize,
}

/// Parse failure with source coordinates.
#[derive(Debug, Error)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }

    fn at(nodes: &BTreeMap<String, NodeInfo>, path: &str, message: impl Into<String>) -> Self {
        let info = nodes.get(path).copied().unwrap_or(NodeInfo { line: 0, column: 0 });
        Self::new(info.line, info.column, message)
    }
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        Self::new(0, 0, format!("failed to read workflow: {err}"))
    }
}

/// Workflow metadata from the `dag` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagMeta {
    pub name: String,
    pub id: Option<String>,
}

/// A unit of work declared in a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feature {
    pub id: String,
    pub layer_id: String,
    pub description: String,
    pub depends_on: Vec<String>,
    /// Raw duration string; parsed by [`parse_duration`] when enforced.
    pub timeout: Option<String>,
}

/// An ordered grouping of features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layer {
    pub id: String,
    pub name: Option<String>,
    pub depends_on: Vec<String>,
    pub features: Vec<Feature>,
}

/// Typed workflow document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workflow {
    pub schema_version: String,
    pub dag: DagMeta,
    pub layers: Vec<Layer>,
}

impl Workflow {
    /// Iterate all features across layers in declaration order.
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.layers.iter().flat_map(|l| l.features.iter())
    }

    /// Look up a feature by id.
    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features().find(|f| f.id == id)
    }
}

/// Parsed workflow plus the source-location index.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub workflow: Workflow,
    pub nodes: BTreeMap<String, NodeInfo>,
}

impl ParseResult {
    pub fn location(&self, path: &str) -> Option<NodeInfo> {
        self.nodes.get(path).copied()
    }
}

/// Parse a workflow document from a string.
pub fn parse_str(text: &str) -> Result<ParseResult, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::new(1, 1, "empty workflow document"));
    }

    let value: Value = serde_yaml::from_str(text).map_err(|e| {
        let (line, column) = e
            .location()
            .map_or((0, 0), |loc| (loc.line(), loc.column()));
        ParseError::new(line, column, format!("invalid YAML: {e}"))
    })?;

    let nodes = build_node_index(text);
    let workflow = decode_workflow(&value, &nodes)?;
    Ok(ParseResult { workflow, nodes })
}

/// Parse a workflow document from a file.
pub fn parse_file(path: &Path) -> Result<ParseResult, ParseError> {
    let text = std::fs::read_to_string(path)?;
    parse_str(&text)
}

/// Parse a duration string like `90s`, `10m`, or `2h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration: {trimmed}"))?;
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration number: {trimmed}"))?;
    let seconds = match unit.trim() {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(Duration::from_secs(seconds))
}

// --- Typed decode over serde_yaml::Value ---

fn decode_workflow(
    value: &Value,
    nodes: &BTreeMap<String, NodeInfo>,
) -> Result<Workflow, ParseError> {
    if !value.is_mapping() {
        return Err(ParseError::new(1, 1, "expected mapping at document root"));
    }

    let schema_version = scalar_field(value, "schema_version", nodes)?.unwrap_or_default();

    let mut dag = DagMeta::default();
    if let Some(dag_value) = value.get("dag") {
        if !dag_value.is_mapping() {
            return Err(ParseError::at(nodes, "dag", "expected mapping at dag"));
        }
        dag.name = scalar_field_at(dag_value, "name", "dag.name", nodes)?.unwrap_or_default();
        dag.id = scalar_field_at(dag_value, "id", "dag.id", nodes)?;
    }

    let mut layers = Vec::new();
    match value.get("layers") {
        None | Some(Value::Null) => {}
        Some(layers_value) => {
            let seq = layers_value
                .as_sequence()
                .ok_or_else(|| ParseError::at(nodes, "layers", "expected sequence at layers"))?;
            for (i, layer_value) in seq.iter().enumerate() {
                layers.push(decode_layer(layer_value, i, nodes)?);
            }
        }
    }

    Ok(Workflow {
        schema_version,
        dag,
        layers,
    })
}

fn decode_layer(
    value: &Value,
    index: usize,
    nodes: &BTreeMap<String, NodeInfo>,
) -> Result<Layer, ParseError> {
    let path = format!("layers[{index}]");
    if !value.is_mapping() {
        return Err(ParseError::at(
            nodes,
            &path,
            format!("expected mapping at {path}"),
        ));
    }

    let id = scalar_field_at(value, "id", &format!("{path}.id"), nodes)?.unwrap_or_default();
    let name = scalar_field_at(value, "name", &format!("{path}.name"), nodes)?;
    let depends_on = string_list(value, "depends_on", &path, nodes)?;

    let mut features = Vec::new();
    match value.get("features") {
        None | Some(Value::Null) => {}
        Some(features_value) => {
            let features_path = format!("{path}.features");
            let seq = features_value.as_sequence().ok_or_else(|| {
                ParseError::at(
                    nodes,
                    &features_path,
                    format!("expected sequence at {features_path}"),
                )
            })?;
            for (j, feature_value) in seq.iter().enumerate() {
                features.push(decode_feature(feature_value, &features_path, j, &id, nodes)?);
            }
        }
    }

    Ok(Layer {
        id,
        name,
        depends_on,
        features,
    })
}

fn decode_feature(
    value: &Value,
    features_path: &str,
    index: usize,
    layer_id: &str,
    nodes: &BTreeMap<String, NodeInfo>,
) -> Result<Feature, ParseError> {
    let path = format!("{features_path}[{index}]");
    if !value.is_mapping() {
        return Err(ParseError::at(
            nodes,
            &path,
            format!("expected mapping at {path}"),
        ));
    }

    let id = scalar_field_at(value, "id", &format!("{path}.id"), nodes)?.unwrap_or_default();
    let description = scalar_field_at(value, "description", &format!("{path}.description"), nodes)?
        .unwrap_or_default();
    let depends_on = string_list(value, "depends_on", &path, nodes)?;
    let timeout = scalar_field_at(value, "timeout", &format!("{path}.timeout"), nodes)?;

    Ok(Feature {
        id,
        layer_id: layer_id.to_string(),
        description,
        depends_on,
        timeout,
    })
}

fn scalar_field(
    parent: &Value,
    key: &str,
    nodes: &BTreeMap<String, NodeInfo>,
) -> Result<Option<String>, ParseError> {
    scalar_field_at(parent, key, key, nodes)
}

fn scalar_field_at(
    parent: &Value,
    key: &str,
    path: &str,
    nodes: &BTreeMap<String, NodeInfo>,
) -> Result<Option<String>, ParseError> {
    match parent.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => scalar_to_string(v)
            .map(Some)
            .ok_or_else(|| ParseError::at(nodes, path, format!("expected scalar at {path}"))),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_list(
    parent: &Value,
    key: &str,
    parent_path: &str,
    nodes: &BTreeMap<String, NodeInfo>,
) -> Result<Vec<String>, ParseError> {
    let path = format!("{parent_path}.{key}");
    match parent.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Null) => Ok(Vec::new()),
        Some(v) => {
            let seq = v
                .as_sequence()
                .ok_or_else(|| ParseError::at(nodes, &path, format!("expected sequence at {path}")))?;
            let mut out = Vec::with_capacity(seq.len());
            for (i, item) in seq.iter().enumerate() {
                let item_path = format!("{path}[{i}]");
                let s = scalar_to_string(item).ok_or_else(|| {
                    ParseError::at(nodes, &item_path, format!("expected scalar at {item_path}"))
                })?;
                out.push(s);
            }
            Ok(out)
        }
    }
}

// --- Position-preserving document walk ---

#[derive(Debug)]
enum Frame {
    /// A mapping key whose value is a nested block.
    Key { indent: usize, path: String },
    /// A block sequence attached to `path`.
    Seq {
        indent: usize,
        path: String,
        index: usize,
    },
    /// The inline mapping scope of a sequence item.
    Item { indent: usize, path: String },
}

impl Frame {
    fn path(&self) -> &str {
        match self {
            Frame::Key { path, .. } | Frame::Seq { path, .. } | Frame::Item { path, .. } => path,
        }
    }
}

/// Build the `NodeInfo` index by walking the document line by line.
///
/// Understands the block-mapping / block-sequence subset that workflow
/// documents use, plus flow sequences (`[a, b]`) and block scalars
/// (`key: |`). Lines inside block scalars are skipped so prose cannot be
/// mistaken for structure.
fn build_node_index(text: &str) -> BTreeMap<String, NodeInfo> {
    let mut nodes = BTreeMap::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut block_scalar_indent: Option<usize> = None;

    for (line_idx, raw_line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let indent = raw_line.len() - raw_line.trim_start_matches(' ').len();
        let content = strip_comment(&raw_line[indent..]);
        let content = content.trim_end();

        if content.is_empty() {
            continue;
        }
        if let Some(scalar_indent) = block_scalar_indent {
            if indent > scalar_indent {
                continue;
            }
            block_scalar_indent = None;
        }
        if content == "---" || content == "..." {
            continue;
        }

        if content == "-" || content.starts_with("- ") {
            handle_sequence_item(&mut stack, &mut nodes, line_no, indent, content);
            // The remainder of the item line, if any, is a key within the
            // item's inline mapping.
            let rest = content[1..].trim_start();
            if !rest.is_empty() {
                let rest_indent = indent + (content.len() - rest.len());
                block_scalar_indent =
                    handle_key_line(&mut stack, &mut nodes, line_no, rest_indent, rest);
            }
        } else if content.contains(':') {
            block_scalar_indent = handle_key_line(&mut stack, &mut nodes, line_no, indent, content);
        }
    }

    nodes
}

fn handle_sequence_item(
    stack: &mut Vec<Frame>,
    nodes: &mut BTreeMap<String, NodeInfo>,
    line_no: usize,
    indent: usize,
    _content: &str,
) {
    // Close scopes that cannot contain an item at this indent. A sequence
    // may sit at the same indent as its parent key, so keys at a lower or
    // equal indent stay.
    while let Some(top) = stack.last() {
        let close = match top {
            Frame::Item { indent: i, .. } => *i >= indent,
            Frame::Seq { indent: i, .. } => *i > indent,
            Frame::Key { indent: i, .. } => *i > indent,
        };
        if close {
            stack.pop();
        } else {
            break;
        }
    }

    let item_path = match stack.last_mut() {
        Some(Frame::Seq {
            indent: seq_indent,
            path,
            index,
        }) if *seq_indent == indent => {
            *index += 1;
            format!("{path}[{index}]")
        }
        _ => {
            let parent_path = stack.last().map(|f| f.path().to_string()).unwrap_or_default();
            stack.push(Frame::Seq {
                indent,
                path: parent_path.clone(),
                index: 0,
            });
            format!("{parent_path}[0]")
        }
    };

    nodes.insert(
        item_path.clone(),
        NodeInfo {
            line: line_no,
            column: indent + 1,
        },
    );
    stack.push(Frame::Item {
        indent,
        path: item_path,
    });
}

/// Handle a `key: value` line; returns the block-scalar indent to skip
/// past when the value opens a literal/folded block.
fn handle_key_line(
    stack: &mut Vec<Frame>,
    nodes: &mut BTreeMap<String, NodeInfo>,
    line_no: usize,
    indent: usize,
    content: &str,
) -> Option<usize> {
    let Some(colon) = content.find(':') else {
        return None;
    };
    let key = content[..colon].trim();
    let value = content[colon + 1..].trim();
    if key.is_empty() {
        return None;
    }

    while let Some(top) = stack.last() {
        let close = match top {
            Frame::Key { indent: i, .. }
            | Frame::Item { indent: i, .. }
            | Frame::Seq { indent: i, .. } => *i >= indent,
        };
        if close {
            stack.pop();
        } else {
            break;
        }
    }

    let parent_path = stack.last().map(|f| f.path().to_string()).unwrap_or_default();
    let path = if parent_path.is_empty() {
        key.to_string()
    } else {
        format!("{parent_path}.{key}")
    };

    nodes.insert(
        path.clone(),
        NodeInfo {
            line: line_no,
            column: indent + 1,
        },
    );

    if value.is_empty() {
        stack.push(Frame::Key { indent, path });
        None
    } else if value == "|" || value == ">" || value.starts_with("|-")
        || value.starts_with("|+")
        || value.starts_with(">-")
        || value.starts_with(">+")
    {
        Some(indent)
    } else {
        if value.starts_with('[') {
            index_flow_sequence(nodes, &path, line_no, content, colon + 1, indent);
        }
        None
    }
}

/// Record element positions inside a flow sequence value like `[a, b]`.
fn index_flow_sequence(
    nodes: &mut BTreeMap<String, NodeInfo>,
    path: &str,
    line_no: usize,
    content: &str,
    value_offset: usize,
    indent: usize,
) {
    let value = &content[value_offset..];
    let Some(open) = value.find('[') else {
        return;
    };
    let body_offset = value_offset + open + 1;
    let body = &content[body_offset..];
    let body = body.strip_suffix(']').unwrap_or(body);

    let mut element_start = 0;
    let mut index = 0;
    for (i, c) in body.char_indices().chain(std::iter::once((body.len(), ','))) {
        if c == ',' {
            let element = &body[element_start..i];
            let leading = element.len() - element.trim_start().len();
            if !element.trim().is_empty() {
                nodes.insert(
                    format!("{path}[{index}]"),
                    NodeInfo {
                        line: line_no,
                        column: indent + body_offset + element_start + leading + 1,
                    },
                );
                index += 1;
            }
            element_start = i + 1;
        }
    }
}

/// Strip a trailing comment from a line, respecting quoted strings.
fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    let mut prev_is_space = true;
    for (i, c) in line.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double && prev_is_space => return &line[..i],
            _ => {}
        }
        prev_is_space = c.is_whitespace();
    }
    line
}
