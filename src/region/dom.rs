use anyhow::Result;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

pub type NodeId = usize;

/// HTML elements that never take children, even when written as `<br>`.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    /// Raw source text, entities left escaped.
    Text(String),
    Comment(String),
    CData(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed page tree. Nodes are addressed by index; moving a node
/// rewrites the child lists of both parents and never invalidates ids.
/// Detached nodes stay in the arena but are unreachable from the root.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub const ROOT: NodeId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Parse storage-format markup. Mismatched end tags are tolerated and
    /// elements left open at EOF are closed implicitly; tokenizer errors
    /// (unterminated tags/comments, broken attributes) are returned.
    pub fn parse(src: &str) -> Result<Self> {
        let mut doc = Self::new();
        let mut reader = Reader::from_str(src);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        let mut open: Vec<NodeId> = Vec::new();

        loop {
            let parent = open.last().copied().unwrap_or(Self::ROOT);
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let (name, attrs) = read_tag(&e)?;
                    let void = is_void(&name);
                    let id = doc.push(
                        parent,
                        NodeKind::Element {
                            name,
                            attrs,
                            self_closing: void,
                        },
                    );
                    if !void {
                        open.push(id);
                    }
                }
                Ok(Event::Empty(e)) => {
                    let (name, attrs) = read_tag(&e)?;
                    doc.push(
                        parent,
                        NodeKind::Element {
                            name,
                            attrs,
                            self_closing: true,
                        },
                    );
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    // Close the nearest matching element; stray end tags are dropped.
                    if let Some(pos) = open.iter().rposition(|&id| doc.is_element(id, &name)) {
                        open.truncate(pos);
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = String::from_utf8_lossy(&t).into_owned();
                    if !text.is_empty() {
                        doc.push(parent, NodeKind::Text(text));
                    }
                }
                Ok(Event::Comment(t)) => {
                    doc.push(parent, NodeKind::Comment(String::from_utf8_lossy(&t).into_owned()));
                }
                Ok(Event::CData(t)) => {
                    doc.push(parent, NodeKind::CData(String::from_utf8_lossy(&t).into_owned()));
                }
                Ok(Event::Eof) => break,
                // Declarations, PIs and doctypes never appear in page bodies.
                Ok(_) => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("malformed markup near byte {}", reader.buffer_position())));
                }
            }
        }

        Ok(doc)
    }

    fn push(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    // ── Queries ──

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings.get(pos + 1).copied()
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId, name: &str) -> bool {
        self.tag_name(id).is_some_and(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn attr(&self, id: NodeId, key: &str) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn has_attr(&self, id: NodeId, key: &str) -> bool {
        self.attr(id, key).is_some()
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .is_some_and(|v| v.split_whitespace().any(|t| t == class))
    }

    pub fn comment_text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Comment(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_blank_text(&self, id: NodeId) -> bool {
        matches!(&self.nodes[id].kind, NodeKind::Text(t) if t.trim().is_empty())
    }

    /// Concatenated raw text of every text/CDATA descendant.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for n in std::iter::once(id).chain(self.descendants(id)) {
            match &self.nodes[n].kind {
                NodeKind::Text(t) | NodeKind::CData(t) => out.push_str(t),
                _ => {}
            }
        }
        out
    }

    /// Pre-order descendants of `id`, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev());
        }
        out
    }

    /// First node reachable from the root, in document order, matching `pred`.
    pub fn find(&self, pred: impl Fn(&Document, NodeId) -> bool) -> Option<NodeId> {
        self.descendants(Self::ROOT)
            .into_iter()
            .find(|&id| pred(self, id))
    }

    // ── Mutation ──

    pub fn create_element(&mut self, name: &str, attrs: &[(&str, &str)]) -> NodeId {
        self.alloc(NodeKind::Element {
            name: name.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            self_closing: false,
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(NodeKind::Text(text.to_string()))
    }

    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.insert(0, child);
    }

    /// Insert `node` right after `reference`. A detached reference is a no-op.
    pub fn insert_after(&mut self, reference: NodeId, node: NodeId) {
        let Some(parent) = self.parent(reference) else {
            return;
        };
        self.detach(node);
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == reference)
            .map_or(self.nodes[parent].children.len(), |p| p + 1);
        self.nodes[node].parent = Some(parent);
        self.nodes[parent].children.insert(pos, node);
    }

    pub fn clear_children(&mut self, id: NodeId) {
        for child in std::mem::take(&mut self.nodes[id].children) {
            self.nodes[child].parent = None;
        }
    }

    pub fn set_attr(&mut self, id: NodeId, key: &str, value: &str) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[id].kind {
            match attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
                Some((_, v)) => *v = value.to_string(),
                None => attrs.push((key.to_string(), value.to_string())),
            }
        }
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        if self.has_class(id, class) {
            return;
        }
        let merged = match self.attr(id, "class").map(str::trim) {
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, class),
            _ => class.to_string(),
        };
        self.set_attr(id, "class", &merged);
    }

    /// Deep-copy the subtree at `id` of `other` into this arena, detached.
    pub fn adopt(&mut self, other: &Document, id: NodeId) -> NodeId {
        let copy = self.alloc(other.kind(id).clone());
        for &child in other.children(id) {
            let c = self.adopt(other, child);
            self.append_child(copy, c);
        }
        copy
    }

    /// Parse `html` and append its top-level nodes under `parent`.
    pub fn append_html(&mut self, parent: NodeId, html: &str) -> Result<()> {
        let fragment = Document::parse(html)?;
        for &top in fragment.children(Self::ROOT) {
            let node = self.adopt(&fragment, top);
            self.append_child(parent, node);
        }
        Ok(())
    }

    // ── Serialization ──

    pub fn serialize(&self) -> String {
        self.serialize_node(Self::ROOT)
    }

    pub fn serialize_node(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in self.children(id) {
            self.write_node(child, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Document => {
                for &child in &node.children {
                    self.write_node(child, out);
                }
            }
            NodeKind::Element {
                name,
                attrs,
                self_closing,
            } => {
                out.push('<');
                out.push_str(name);
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(&v.replace('"', "&quot;"));
                    out.push('"');
                }
                if node.children.is_empty() && (*self_closing || is_void(name)) {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for &child in &node.children {
                    self.write_node(child, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            NodeKind::Text(t) => out.push_str(t),
            NodeKind::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeKind::CData(c) => {
                out.push_str("<![CDATA[");
                out.push_str(c);
                out.push_str("]]>");
            }
        }
    }
}

fn read_tag(e: &BytesStart<'_>) -> Result<(String, Vec<(String, String)>)> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    // A bare `<` in text ("a < b") tokenizes as a tag with no usable name.
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        anyhow::bail!("invalid tag name {:?}", name);
    }
    let mut attrs = Vec::new();
    for attr in e.html_attributes().with_checks(false) {
        let attr = attr?;
        attrs.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        ));
    }
    Ok((name, attrs))
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(name))
}
