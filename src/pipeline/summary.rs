//! Summary graphs: a hierarchy derived from one valid extraction result.
//!
//! The model is asked for a `{label, children}` tree. The reply goes through
//! the generic sanitizer, is parsed into a [`SummaryTree`], flattened into
//! [`GraphNode`]s (ids `n0`, `n1`, ... in pre-order) and rendered as diagram
//! text. Parsing and rendering are pure; the network call lives in
//! [`crate::Pipeline::summarize`].
//!
//! ## Flowchart grammar (default)
//!
//! ```text
//! diagram    := "graph TD" NEWLINE { node_decl } { edge }
//! node_decl  := INDENT id "[\"" label "\"]" NEWLINE
//! edge       := INDENT id " --> " id NEWLINE
//! ```
//!
//! Labels are whitespace-collapsed, cut to `max_label_chars` with `…`, and
//! have `"` written as `#quot;`.

use crate::config::DiagramSyntax;
use crate::output::{GraphNode, SummaryGraph};
use crate::pipeline::sanitize::{sanitize, RepairPolicy};
use serde_json::Value;

const INDENT: &str = "    ";

/// Keys that name a node, in priority order.
const LABEL_KEYS: &[&str] = &["label", "name", "title", "central_topic", "topic", "text"];

/// Keys whose arrays hold a node's children; all of them are collected.
const CHILD_KEYS: &[&str] = &["children", "branches", "nodes", "subtopics", "details"];

const UNTITLED: &str = "Summary";

/// Rendering limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOptions {
    pub syntax: DiagramSyntax,
    pub max_label_chars: usize,
    /// Levels kept, root included.
    pub max_depth: usize,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            syntax: DiagramSyntax::Flowchart,
            max_label_chars: 60,
            max_depth: 6,
        }
    }
}

/// A parsed hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryTree {
    pub label: String,
    pub children: Vec<SummaryTree>,
}

impl SummaryTree {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }
}

/// Parse a summary reply value into a tree.
///
/// Accepts `{label|name|title|central_topic, children|branches|details}`
/// recursively with bare strings as leaves. Objects without any of those
/// keys become one node per entry (`key` with its value as children, or a
/// `key: value` leaf). Returns `None` for scalars and empty structures.
pub fn parse_tree(value: &Value, max_depth: usize) -> Option<SummaryTree> {
    if !(value.is_object() || value.is_array()) {
        return None;
    }
    let mut nodes = build_nodes(value, 0, max_depth.max(1));
    match nodes.len() {
        0 => None,
        1 if is_labelled(value) => nodes.pop(),
        _ => {
            // Several top-level nodes: hang them under a synthetic root, one level down.
            let mut children = build_nodes(value, 1, max_depth.max(1));
            children.retain(|c| !c.label.is_empty());
            Some(SummaryTree {
                label: UNTITLED.to_string(),
                children,
            })
        }
    }
}

fn is_labelled(value: &Value) -> bool {
    match value {
        Value::Object(map) => LABEL_KEYS
            .iter()
            .chain(CHILD_KEYS)
            .any(|k| map.contains_key(*k)),
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Nodes for `value` placed at `depth`; nothing at or beyond `max_depth`.
fn build_nodes(value: &Value, depth: usize, max_depth: usize) -> Vec<SummaryTree> {
    if depth >= max_depth {
        return Vec::new();
    }
    match value {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| build_nodes(item, depth, max_depth))
            .collect(),
        Value::Object(map) if is_labelled(value) => {
            let label = LABEL_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(scalar_text))
                .unwrap_or_else(|| UNTITLED.to_string());
            let children = CHILD_KEYS
                .iter()
                .filter_map(|k| map.get(*k))
                .flat_map(|v| build_nodes(v, depth + 1, max_depth))
                .collect();
            vec![SummaryTree { label, children }]
        }
        Value::Object(map) => map
            .iter()
            .map(|(key, v)| match scalar_text(v) {
                Some(text) => SummaryTree::leaf(format!("{key}: {text}")),
                None => SummaryTree {
                    label: key.clone(),
                    children: build_nodes(v, depth + 1, max_depth),
                },
            })
            .collect(),
        other => scalar_text(other).map(SummaryTree::leaf).into_iter().collect(),
    }
}

/// Flatten and render a tree.
pub fn build_graph(tree: &SummaryTree, options: &SummaryOptions) -> SummaryGraph {
    let mut nodes = Vec::new();
    flatten(tree, &mut nodes);
    SummaryGraph {
        root: "n0".to_string(),
        nodes,
        diagram: render(tree, options),
        diagnostic: None,
    }
}

/// A root-only graph explaining why no hierarchy is available.
pub fn degraded_graph(reason: &str, options: &SummaryOptions) -> SummaryGraph {
    let tree = SummaryTree::leaf(format!("Summary unavailable: {reason}"));
    SummaryGraph {
        diagnostic: Some(reason.to_string()),
        ..build_graph(&tree, options)
    }
}

/// Sanitize a summary reply and turn it into a graph; never fails.
pub fn graph_from_reply(raw: &str, policy: &RepairPolicy, options: &SummaryOptions) -> SummaryGraph {
    let sanitized = sanitize(raw, policy);
    let Some(value) = sanitized.value else {
        let reason = sanitized
            .issues
            .first()
            .map(|i| i.message.clone())
            .unwrap_or_else(|| "reply could not be parsed".to_string());
        return degraded_graph(&reason, options);
    };
    match parse_tree(&value, options.max_depth) {
        Some(tree) => build_graph(&tree, options),
        None => degraded_graph("reply has no recognisable hierarchy", options),
    }
}

fn flatten(tree: &SummaryTree, nodes: &mut Vec<GraphNode>) -> String {
    let id = format!("n{}", nodes.len());
    let index = nodes.len();
    nodes.push(GraphNode {
        id: id.clone(),
        label: collapse_whitespace(&tree.label),
        children: Vec::new(),
    });
    for child in &tree.children {
        let child_id = flatten(child, nodes);
        nodes[index].children.push(child_id);
    }
    id
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Label as written into diagram text.
pub fn diagram_label(label: &str, max_chars: usize) -> String {
    let collapsed = collapse_whitespace(label);
    let shortened = if collapsed.chars().count() > max_chars {
        let mut s: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
        s.push('…');
        s
    } else {
        collapsed
    };
    shortened.replace('"', "#quot;")
}

/// Render a tree in the configured syntax. Ids match [`build_graph`].
pub fn render(tree: &SummaryTree, options: &SummaryOptions) -> String {
    match options.syntax {
        DiagramSyntax::Flowchart => render_flowchart(tree, options.max_label_chars),
        DiagramSyntax::Mindmap => render_mindmap(tree, options.max_label_chars),
    }
}

fn render_flowchart(tree: &SummaryTree, max_label: usize) -> String {
    let mut decls = Vec::new();
    let mut edges = Vec::new();
    let mut counter = 0usize;
    walk_flowchart(tree, max_label, &mut counter, &mut decls, &mut edges);

    let mut out = String::from("graph TD\n");
    for line in decls.into_iter().chain(edges) {
        out.push_str(INDENT);
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn walk_flowchart(
    tree: &SummaryTree,
    max_label: usize,
    counter: &mut usize,
    decls: &mut Vec<String>,
    edges: &mut Vec<String>,
) {
    let id = format!("n{counter}");
    *counter += 1;
    decls.push(format!("{id}[\"{}\"]", diagram_label(&tree.label, max_label)));
    for child in &tree.children {
        edges.push(format!("{id} --> n{counter}"));
        walk_flowchart(child, max_label, counter, decls, edges);
    }
}

fn render_mindmap(tree: &SummaryTree, max_label: usize) -> String {
    let mut out = String::from("mindmap\n");
    let mut counter = 0usize;
    walk_mindmap(tree, max_label, 1, &mut counter, &mut out);
    out
}

fn walk_mindmap(tree: &SummaryTree, max_label: usize, level: usize, counter: &mut usize, out: &mut String) {
    let id = format!("n{counter}");
    *counter += 1;
    let label = diagram_label(&tree.label, max_label);
    out.push_str(&"  ".repeat(level));
    if level == 1 {
        out.push_str(&format!("{id}((\"{label}\"))\n"));
    } else {
        out.push_str(&format!("{id}[\"{label}\"]\n"));
    }
    for child in &tree.children {
        walk_mindmap(child, max_label, level + 1, counter, out);
    }
}
