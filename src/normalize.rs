//! HTML canonicalization.
//!
//! Arbitrary article markup (feed content, extraction-service output) is
//! reduced to a flat sequence of `<p>` blocks containing a restricted set of
//! tags:
//!
//! 1. blacklisted structural/media tags and the source's exclusion selector
//!    are removed with their subtree;
//! 2. `div` becomes `p`;
//! 3. tags outside the allow-list are unwrapped (children kept);
//! 4. anchors get absolute `href`s and `target="_blank"`;
//! 5. runs of `<br>` collapse to one;
//! 6. comments are dropped;
//! 7. top-level content is re-segmented into paragraphs;
//! 8. top-level `<br>` separates paragraphs;
//! 9. empty paragraphs are dropped;
//! 10. there is no `html`/`body` wrapper in the output;
//! 11. non-breaking spaces become plain spaces.
//!
//! The output is deterministic and [`normalize_content`] is idempotent on its
//! own output. Attributes other than anchor `href`/`target` and table-cell
//! spans are dropped, and whitespace runs collapse to a single space.

use ego_tree::{NodeId, NodeRef};
use scraper::{Html, Node as DomNode, Selector};
use std::collections::HashSet;
use tracing::warn;
use url::Url;

const BLACKLIST: &[&str] = &[
    "img", "figcaption", "figure", "hr", "source", "object", "video", "audio", "track", "embed",
    "param", "map", "area", "form", "input", "button", "canvas", "style", "script", "svg",
    "picture", "iframe", "noscript", "template", "head", "title", "meta", "link",
];

const ALLOWLIST: &[&str] = &[
    "a", "p", "i", "strong", "b", "br", "table", "tr", "th", "td", "h1", "h2", "h3", "h4", "h5",
    "h6", "pre", "blockquote", "ul", "ol", "li", "dl", "dt", "dd", "em", "small", "s", "cite",
    "code", "sub", "sup", "span", "tbody", "thead", "tfoot",
];

const TABLE_STRUCTURE: &[&str] = &["table", "thead", "tbody", "tfoot", "tr"];

const INLINE: &[&str] = &[
    "a", "b", "cite", "code", "em", "i", "s", "small", "span", "strong", "sub", "sup",
];

/// Tags dropped before the page is handed to the extraction service.
const SANITIZE_BLACKLIST: &[&str] = &["style", "script", "svg", "picture"];

const VOID: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        children: Vec<Node>,
    },
}

impl Node {
    fn name(&self) -> Option<&str> {
        match self {
            Node::Element { name, .. } => Some(name),
            Node::Text(_) => None,
        }
    }

    fn is_block(&self) -> bool {
        match self.name() {
            Some(name) => name != "br" && !INLINE.contains(&name),
            None => false,
        }
    }

    fn is_blank_text(&self) -> bool {
        matches!(self, Node::Text(t) if t.trim().is_empty())
    }

    fn text_content(&self, out: &mut String) {
        match self {
            Node::Text(t) => out.push_str(t),
            Node::Element { children, .. } => {
                for c in children {
                    c.text_content(out);
                }
            }
        }
    }
}

struct Walker<'a> {
    excluded: HashSet<NodeId>,
    base: Option<Url>,
    blacklist: &'a [&'a str],
}

/// Canonicalize an HTML fragment or document.
pub fn normalize_content(content: &str, base_url: Option<&str>, exclude: Option<&str>) -> String {
    let joined = content
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ");
    let document = Html::parse_document(&joined);

    let walker = Walker {
        excluded: excluded_ids(&document, exclude),
        base: base_url.and_then(|b| Url::parse(b).ok()),
        blacklist: BLACKLIST,
    };

    let mut top = Vec::new();
    for child in top_level(&document).children() {
        walker.convert(child, &mut top);
    }
    tidy(&mut top);

    let mut paragraphs = Vec::new();
    let mut current = Vec::new();
    segment(top, &mut current, &mut paragraphs);
    finish(&mut current, &mut paragraphs);

    paragraphs
        .into_iter()
        .map(|children| {
            let mut out = String::from("<p>");
            for c in &children {
                serialize(c, &mut out);
            }
            out.push_str("</p>");
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip `style`/`script`/`svg`/`picture` and the exclusion selector from a
/// full page, keeping everything else as-is.
pub fn sanitize_html(html: &str, exclude: Option<&str>) -> String {
    let document = Html::parse_document(html);
    let excluded = excluded_ids(&document, exclude);
    let mut out = String::new();
    for child in document.tree.root().children() {
        write_raw(child, &excluded, &mut out);
    }
    out
}

/// Unescape entities and strip markup from a title or author string.
pub fn clean_text(s: &str) -> String {
    let fragment = Html::parse_fragment(s);
    let text: String = fragment.root_element().text().collect();
    collapse_whitespace(&text.replace('\u{a0}', " "))
        .trim()
        .to_string()
}

fn excluded_ids(document: &Html, exclude: Option<&str>) -> HashSet<NodeId> {
    let selector = match exclude.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s,
        None => return HashSet::new(),
    };
    match Selector::parse(selector) {
        Ok(sel) => document.select(&sel).map(|e| e.id()).collect(),
        Err(e) => {
            warn!(selector, error = ?e, "ignoring invalid exclusion selector");
            HashSet::new()
        }
    }
}

/// The node whose children form the top level of the content: `body`,
/// falling back to `html`, falling back to the document root.
fn top_level(document: &Html) -> NodeRef<'_, DomNode> {
    for name in ["body", "html"] {
        if let Ok(sel) = Selector::parse(name) {
            if let Some(el) = document.select(&sel).next() {
                return *el;
            }
        }
    }
    document.tree.root()
}

impl Walker<'_> {
    fn convert(&self, node: NodeRef<'_, DomNode>, out: &mut Vec<Node>) {
        match node.value() {
            DomNode::Text(text) => {
                let t = text.replace('\u{a0}', " ");
                push_text(out, &t);
            }
            DomNode::Element(el) => {
                let tag = el.name().to_ascii_lowercase();
                if self.blacklist.contains(&tag.as_str()) || self.excluded.contains(&node.id()) {
                    return;
                }

                let mut children = Vec::new();
                for child in node.children() {
                    self.convert(child, &mut children);
                }

                let name = if tag == "div" { "p".to_string() } else { tag };
                if !ALLOWLIST.contains(&name.as_str()) {
                    splice(out, children);
                    return;
                }

                // Paragraphs and inline elements cannot hold blocks, and a
                // heading cannot hold another heading; lift the children so
                // the parser does not reshape them on re-read.
                let holds_block = children.iter().any(Node::is_block);
                if holds_block && (name == "p" || INLINE.contains(&name.as_str())) {
                    splice(out, children);
                    return;
                }
                let holds_heading = children.iter().any(|c| c.name().is_some_and(is_heading));
                if is_heading(&name) && holds_heading {
                    splice(out, children);
                    return;
                }

                // Table content outside the row/cell structure is moved in
                // front of the table, as the parser would do.
                if TABLE_STRUCTURE.contains(&name.as_str()) {
                    let mut fostered = Vec::new();
                    children = table_children(&name, children, &mut fostered);
                    splice(out, fostered);
                }

                // A list item directly inside another one ends it
                let closers: &[&str] = match name.as_str() {
                    "li" => &["li"],
                    "dt" | "dd" => &["dt", "dd"],
                    _ => &[],
                };
                let rest = match children
                    .iter()
                    .position(|c| c.name().is_some_and(|n| closers.contains(&n)))
                {
                    Some(pos) => children.split_off(pos),
                    None => Vec::new(),
                };

                if name == "p" {
                    let mut text = String::new();
                    for c in &children {
                        c.text_content(&mut text);
                    }
                    if text.trim().is_empty() {
                        return;
                    }
                }

                let attrs = self.attributes(&name, el);
                out.push(Node::Element {
                    name,
                    attrs,
                    children,
                });
                splice(out, rest);
            }
            // Comments, doctypes and processing instructions are dropped
            _ => {}
        }
    }

    fn attributes(&self, name: &str, el: &scraper::node::Element) -> Vec<(String, String)> {
        match name {
            "a" => match el.attr("href") {
                Some(href) => vec![
                    ("href".to_string(), self.absolutize(href.trim())),
                    ("target".to_string(), "_blank".to_string()),
                ],
                None => Vec::new(),
            },
            "td" | "th" => ["colspan", "rowspan"]
                .iter()
                .filter_map(|a| el.attr(a).map(|v| (a.to_string(), v.to_string())))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn absolutize(&self, href: &str) -> String {
        match (&self.base, Url::parse(href)) {
            (Some(base), Err(url::ParseError::RelativeUrlWithoutBase)) => base
                .join(href)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| href.to_string()),
            _ => href.to_string(),
        }
    }
}

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

fn table_child_allowed(parent: &str, child: &str) -> bool {
    match parent {
        "table" => matches!(child, "thead" | "tbody" | "tfoot"),
        "thead" | "tbody" | "tfoot" => child == "tr",
        "tr" => matches!(child, "td" | "th"),
        _ => true,
    }
}

fn wrap(name: &str, children: Vec<Node>) -> Node {
    Node::Element {
        name: name.to_string(),
        attrs: Vec::new(),
        children,
    }
}

/// Keep only row/cell structure under a table element. Bare cells get a
/// `tr`, bare rows in a table get a `tbody`; anything else goes to
/// `fostered` and blank text is dropped.
fn table_children(parent: &str, children: Vec<Node>, fostered: &mut Vec<Node>) -> Vec<Node> {
    let mut kept = Vec::new();
    let mut cells = Vec::new();
    let mut rows = Vec::new();

    fn flush_cells(
        parent: &str,
        cells: &mut Vec<Node>,
        rows: &mut Vec<Node>,
        kept: &mut Vec<Node>,
    ) {
        if cells.is_empty() {
            return;
        }
        let row = wrap("tr", std::mem::take(cells));
        if parent == "table" {
            rows.push(row);
        } else {
            kept.push(row);
        }
    }

    fn flush_rows(rows: &mut Vec<Node>, kept: &mut Vec<Node>) {
        if !rows.is_empty() {
            kept.push(wrap("tbody", std::mem::take(rows)));
        }
    }

    for child in children {
        let is_cell = matches!(child.name(), Some("td" | "th"));
        let is_row = child.name() == Some("tr");
        let allowed = child.name().is_some_and(|n| table_child_allowed(parent, n));
        if is_cell && parent != "tr" {
            cells.push(child);
        } else if is_row && parent == "table" {
            flush_cells(parent, &mut cells, &mut rows, &mut kept);
            rows.push(child);
        } else if allowed {
            flush_cells(parent, &mut cells, &mut rows, &mut kept);
            flush_rows(&mut rows, &mut kept);
            kept.push(child);
        } else if !child.is_blank_text() {
            fostered.push(child);
        }
    }
    flush_cells(parent, &mut cells, &mut rows, &mut kept);
    flush_rows(&mut rows, &mut kept);
    kept
}

fn push_text(out: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text(last)) = out.last_mut() {
        last.push_str(text);
    } else {
        out.push(Node::Text(text.to_string()));
    }
}

fn splice(out: &mut Vec<Node>, children: Vec<Node>) {
    for c in children {
        match c {
            Node::Text(t) => push_text(out, &t),
            element => out.push(element),
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

/// Merge adjacent text, collapse whitespace and drop redundant `<br>`s.
fn tidy(nodes: &mut Vec<Node>) {
    let mut merged: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes.drain(..) {
        match node {
            Node::Text(t) => push_text(&mut merged, &t),
            Node::Element {
                name,
                attrs,
                mut children,
            } => {
                tidy(&mut children);
                merged.push(Node::Element {
                    name,
                    attrs,
                    children,
                });
            }
        }
    }

    for node in merged.iter_mut() {
        if let Node::Text(t) = node {
            *t = collapse_whitespace(t);
        }
    }

    // A <br> followed (ignoring blank text) by another <br> is redundant
    let mut result: Vec<Node> = Vec::with_capacity(merged.len());
    for (i, node) in merged.iter().enumerate() {
        if node.name() == Some("br") {
            let next = merged[i + 1..].iter().find(|n| !n.is_blank_text());
            if next.and_then(Node::name) == Some("br") {
                continue;
            }
        }
        result.push(node.clone());
    }

    // Dropping a <br> can leave two text nodes side by side
    nodes.clear();
    splice(nodes, result);
    for node in nodes.iter_mut() {
        if let Node::Text(t) = node {
            *t = collapse_whitespace(t);
        }
    }
}

fn segment(nodes: Vec<Node>, current: &mut Vec<Node>, paragraphs: &mut Vec<Vec<Node>>) {
    for node in nodes {
        match node.name() {
            None => current.push(node),
            Some("br") => finish(current, paragraphs),
            Some("p") => {
                finish(current, paragraphs);
                if let Node::Element { children, .. } = node {
                    segment(children, current, paragraphs);
                }
                finish(current, paragraphs);
            }
            Some(_) if node.is_block() => {
                finish(current, paragraphs);
                current.push(node);
            }
            Some(_) => current.push(node),
        }
    }
}

fn finish(current: &mut Vec<Node>, paragraphs: &mut Vec<Vec<Node>>) {
    let mut children = std::mem::take(current);
    tidy(&mut children);

    if let Some(Node::Text(t)) = children.first_mut() {
        *t = t.trim_start().to_string();
    }
    if let Some(Node::Text(t)) = children.last_mut() {
        *t = t.trim_end().to_string();
    }
    children.retain(|c| !matches!(c, Node::Text(t) if t.is_empty()));

    let mut text = String::new();
    for c in &children {
        c.text_content(&mut text);
    }
    if !text.trim().is_empty() {
        paragraphs.push(children);
    }
}

fn escape_text(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push(' '),
            c => out.push(c),
        }
    }
}

fn escape_attr(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            c => out.push(c),
        }
    }
}

fn serialize(node: &Node, out: &mut String) {
    match node {
        Node::Text(t) => escape_text(t, out),
        Node::Element {
            name,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(name);
            for (k, v) in attrs {
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                escape_attr(v, out);
                out.push('"');
            }
            out.push('>');
            if VOID.contains(&name.as_str()) {
                return;
            }
            for c in children {
                serialize(c, out);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
    }
}

fn write_raw(node: NodeRef<'_, DomNode>, excluded: &HashSet<NodeId>, out: &mut String) {
    match node.value() {
        DomNode::Doctype(doctype) => {
            out.push_str("<!DOCTYPE ");
            out.push_str(doctype.name());
            out.push('>');
        }
        DomNode::Text(text) => escape_text(text, out),
        DomNode::Element(el) => {
            let name = el.name();
            if SANITIZE_BLACKLIST.contains(&name) || excluded.contains(&node.id()) {
                return;
            }
            out.push('<');
            out.push_str(name);
            for (k, v) in el.attrs() {
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                escape_attr(v, out);
                out.push('"');
            }
            out.push('>');
            if VOID.contains(&name) {
                return;
            }
            for child in node.children() {
                write_raw(child, excluded, out);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        _ => {}
    }
}
