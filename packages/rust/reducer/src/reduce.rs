//! Minimal semantic tree reduction.
//!
//! Parses a document, drops non-rendered nodes, collapses the tree bottom-up
//! and prints it as indented tags:
//!
//! ```text
//! <article>
//!   <h1>
//!     Pricing
//!   </h1>
//!   <a href="/contact">
//!     Contact sales
//!   </a>
//! </article>
//! ```

use scraper::{ElementRef, Html, Node};
use tracing::debug;

/// Elements removed together with their subtree.
const DROPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "iframe", "svg"];

/// Table parts only parse inside their table context, so they are never
/// elided and never hoisted into a parent's place.
const TABLE_PARTS: &[&str] = &[
    "table", "caption", "colgroup", "col", "thead", "tbody", "tfoot", "tr", "td", "th",
];

/// Deeper documents are returned unreduced.
const MAX_DEPTH: usize = 256;

const INDENT: &str = "  ";

/// A node of the reduced tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReducedNode {
    Text(String),
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<ReducedNode>,
    },
}

impl ReducedNode {
    fn tag(&self) -> Option<&str> {
        match self {
            Self::Element { tag, .. } => Some(tag),
            Self::Text(_) => None,
        }
    }
}

struct TooDeep;

/// Reduce `raw` to its indented minimal form, keeping only `keep_attrs`.
///
/// Deterministic and idempotent. Markup that yields no tree (or nests beyond
/// the supported depth) is returned unchanged.
pub fn reduce<S: AsRef<str>>(raw: &str, keep_attrs: &[S]) -> String {
    match reduce_tree(raw, keep_attrs) {
        Some(tree) => serialize(&tree),
        None => raw.to_string(),
    }
}

/// Parse and collapse `raw` without serializing it.
pub(crate) fn reduce_tree<S: AsRef<str>>(raw: &str, keep_attrs: &[S]) -> Option<ReducedNode> {
    let doc = Html::parse_document(raw);
    match collapse(doc.root_element(), keep_attrs, 0) {
        Ok(tree) => tree,
        Err(TooDeep) => {
            debug!(max_depth = MAX_DEPTH, "document too deep, keeping raw content");
            None
        }
    }
}

fn collapse<S: AsRef<str>>(
    el: ElementRef<'_>,
    keep_attrs: &[S],
    depth: usize,
) -> Result<Option<ReducedNode>, TooDeep> {
    if depth > MAX_DEPTH {
        return Err(TooDeep);
    }
    let tag = el.value().name();
    if DROPPED_TAGS.contains(&tag) {
        return Ok(None);
    }

    let mut children: Vec<ReducedNode> = Vec::new();
    for child in el.children() {
        let reduced = match child.value() {
            Node::Text(text) => normalize_text(text).map(ReducedNode::Text),
            Node::Element(_) => match ElementRef::wrap(child) {
                Some(child_el) => collapse(child_el, keep_attrs, depth + 1)?,
                None => None,
            },
            _ => None,
        };
        let Some(node) = reduced else {
            continue;
        };
        // Text separated only by dropped nodes becomes one run.
        if let (ReducedNode::Text(next), Some(ReducedNode::Text(prev))) =
            (&node, children.last_mut())
        {
            prev.push(' ');
            prev.push_str(next);
            continue;
        }
        children.push(node);
    }

    if children.is_empty() {
        return Ok(None);
    }

    if children.len() == 1 && !TABLE_PARTS.contains(&tag) {
        if let Some(child_tag) = children[0].tag() {
            if !TABLE_PARTS.contains(&child_tag) {
                return Ok(children.pop());
            }
        }
    }

    let attrs = keep_attrs
        .iter()
        .filter_map(|name| {
            let name = name.as_ref();
            el.value()
                .attr(name)
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();

    Ok(Some(ReducedNode::Element {
        tag: tag.to_string(),
        attrs,
        children,
    }))
}

fn normalize_text(text: &str) -> Option<String> {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!joined.is_empty()).then_some(joined)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Pre-order indented tag printing.
pub(crate) fn serialize(node: &ReducedNode) -> String {
    let mut out = String::new();
    write_node(node, 0, &mut out);
    out
}

fn write_node(node: &ReducedNode, depth: usize, out: &mut String) {
    let indent = INDENT.repeat(depth);
    match node {
        ReducedNode::Text(text) => {
            out.push_str(&indent);
            out.push_str(&escape_text(text));
            out.push('\n');
        }
        ReducedNode::Element {
            tag,
            attrs,
            children,
        } => {
            out.push_str(&indent);
            out.push('<');
            out.push_str(tag);
            for (name, value) in attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
            }
            out.push_str(">\n");
            for child in children {
                write_node(child, depth + 1, out);
            }
            out.push_str(&indent);
            out.push_str("</");
            out.push_str(tag);
            out.push_str(">\n");
        }
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}
