use std::fmt;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::dom::{Document, NodeId};
use super::legacy::{find_legacy_span, migrate_legacy_block};
use super::markers::*;

/// What to do when a page carries no managed region at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    Append,
    ReplaceAll,
}

/// Which search located an existing container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    Attribute,
    Class,
    BeginCommentSibling,
    CommentWrapper,
    GeneratedParent,
}

impl Locator {
    pub fn name(self) -> &'static str {
        match self {
            Locator::Attribute => "attribute",
            Locator::Class => "class",
            Locator::BeginCommentSibling => "begin_comment_sibling",
            Locator::CommentWrapper => "comment_wrapper",
            Locator::GeneratedParent => "generated_parent",
        }
    }

    fn find(self, doc: &Document) -> Option<NodeId> {
        match self {
            Locator::Attribute => doc.find(|d, id| d.has_attr(id, MANAGED_ATTR)),
            Locator::Class => doc.find(|d, id| d.has_class(id, MANAGED_CLASS)),
            Locator::BeginCommentSibling => {
                let begin = doc.find(|d, id| d.comment_text(id).is_some_and(is_begin_comment))?;
                let mut cursor = doc.next_sibling(begin);
                while let Some(id) = cursor {
                    if doc.comment_text(id).is_some_and(is_end_comment) {
                        return None;
                    }
                    if doc.is_element(id, "div") {
                        return Some(id);
                    }
                    cursor = doc.next_sibling(id);
                }
                None
            }
            Locator::CommentWrapper => doc.find(|d, id| {
                d.is_element(id, "div")
                    && d.children(id)
                        .iter()
                        .any(|&c| d.comment_text(c).is_some_and(is_begin_comment))
            }),
            Locator::GeneratedParent => {
                let generated = doc.find(is_generated)?;
                doc.parent(generated)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePath {
    Container(Locator),
    AnchorReconstruct,
    LegacyMigration,
    Appended,
    ReplacedAll,
}

impl fmt::Display for MergePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePath::Container(l) => write!(f, "container:{}", l.name()),
            MergePath::AnchorReconstruct => f.write_str("anchor_reconstruct"),
            MergePath::LegacyMigration => f.write_str("legacy_migration"),
            MergePath::Appended => f.write_str("appended"),
            MergePath::ReplacedAll => f.write_str("replaced_all"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub html: String,
    pub path: MergePath,
}

/// Merge `inner_html` into the managed region of `existing_html` and return
/// the new page body. Never fails; degradations are logged.
pub fn upsert_managed_block(existing_html: &str, inner_html: &str, on_missing: OnMissing) -> String {
    merge(existing_html, inner_html, on_missing).html
}

/// Same as [`upsert_managed_block`], also reporting which path was taken.
pub fn merge(existing_html: &str, inner_html: &str, on_missing: OnMissing) -> MergeOutcome {
    match Document::parse(existing_html) {
        Ok(mut doc) => {
            if let Some(path) = merge_into_tree(&mut doc, inner_html) {
                debug!("Merged managed region via {}", path);
                return MergeOutcome {
                    html: doc.serialize(),
                    path,
                };
            }
        }
        Err(e) => warn!("Page body did not parse, skipping container search: {:#}", e),
    }

    if let Some(span) = find_legacy_span(existing_html) {
        return MergeOutcome {
            html: migrate_legacy_block(existing_html, &span, inner_html),
            path: MergePath::LegacyMigration,
        };
    }

    no_region(existing_html, inner_html, on_missing)
}

// ── States A and B ──

fn merge_into_tree(doc: &mut Document, inner_html: &str) -> Option<MergePath> {
    for locator in [
        Locator::Attribute,
        Locator::Class,
        Locator::BeginCommentSibling,
        Locator::CommentWrapper,
    ] {
        if let Some(container) = locator.find(doc) {
            fill_container(doc, container, inner_html);
            return Some(MergePath::Container(locator));
        }
    }

    if reconstruct_from_anchors(doc, inner_html) {
        return Some(MergePath::AnchorReconstruct);
    }

    let container = Locator::GeneratedParent.find(doc)?;
    let container = if container == Document::ROOT {
        // Generated content left at the top level: give it a fresh wrapper.
        let generated = doc.find(is_generated)?;
        let wrapper = doc.create_element("div", &[]);
        doc.insert_after(generated, wrapper);
        doc.append_child(wrapper, generated);
        wrapper
    } else {
        container
    };
    fill_container(doc, container, inner_html);
    Some(MergePath::Container(Locator::GeneratedParent))
}

fn is_generated(doc: &Document, id: NodeId) -> bool {
    doc.has_attr(id, GENERATED_ATTR) || doc.has_class(id, GENERATED_CLASS)
}

fn reaffirm(doc: &mut Document, id: NodeId, attr: &str, class: &str) {
    if doc.attr(id, attr) != Some("true") {
        doc.set_attr(id, attr, "true");
    }
    doc.add_class(id, class);
}

/// Replace the generated child of `container` with `inner_html`, leaving
/// human siblings inside the container untouched.
fn fill_container(doc: &mut Document, container: NodeId, inner_html: &str) {
    reaffirm(doc, container, MANAGED_ATTR, MANAGED_CLASS);

    let generated = match doc
        .descendants(container)
        .into_iter()
        .find(|&id| is_generated(doc, id))
    {
        Some(g) => g,
        None => {
            debug!("Managed container had no generated child, creating one");
            let g = doc.create_element("div", &[]);
            doc.prepend_child(container, g);
            g
        }
    };
    reaffirm(doc, generated, GENERATED_ATTR, GENERATED_CLASS);

    doc.clear_children(generated);
    install(doc, generated, inner_html);
}

/// Fresh, detached container with an empty generated-content child.
pub(super) fn create_container(doc: &mut Document) -> (NodeId, NodeId) {
    let container = doc.create_element("div", &[(MANAGED_ATTR, "true"), ("class", MANAGED_CLASS)]);
    let generated = doc.create_element("div", &[(GENERATED_ATTR, "true"), ("class", GENERATED_CLASS)]);
    doc.append_child(container, generated);
    (container, generated)
}

pub(super) fn install(doc: &mut Document, parent: NodeId, inner_html: &str) {
    if let Err(e) = doc.append_html(parent, inner_html) {
        warn!("Generated fragment did not parse, inserting it verbatim: {:#}", e);
        let raw = doc.create_text(inner_html);
        doc.append_child(parent, raw);
    }
}

/// The block-level node carrying an anchor: the macro itself, or a `p`
/// that wraps nothing but the macro.
fn anchor_block(doc: &Document, anchor: &str) -> Option<NodeId> {
    let param = doc.find(|d, id| d.is_element(id, ANCHOR_PARAM) && d.text_content(id).trim() == anchor)?;

    let mut node = param;
    while let Some(parent) = doc.parent(node) {
        node = parent;
        if doc.is_element(node, ANCHOR_MACRO) {
            break;
        }
    }
    if !doc.is_element(node, ANCHOR_MACRO) {
        node = doc.parent(param)?;
    }

    match doc.parent(node) {
        Some(p)
            if doc.is_element(p, "p")
                && doc
                    .children(p)
                    .iter()
                    .all(|&c| c == node || doc.is_blank_text(c)) =>
        {
            Some(p)
        }
        _ => Some(node),
    }
}

/// Rebuild a container from whatever lies between the two anchor macros.
/// The in-between nodes are absorbed and then replaced by `inner_html`.
fn reconstruct_from_anchors(doc: &mut Document, inner_html: &str) -> bool {
    let (Some(start), Some(end)) = (anchor_block(doc, ANCHOR_START), anchor_block(doc, ANCHOR_END))
    else {
        return false;
    };
    let Some(parent) = doc.parent(start) else {
        return false;
    };
    if doc.parent(end) != Some(parent) {
        debug!("Anchor macros live under different parents, cannot rebuild between them");
        return false;
    }

    let siblings = doc.children(parent);
    let (Some(s), Some(e)) = (
        siblings.iter().position(|&c| c == start),
        siblings.iter().position(|&c| c == end),
    ) else {
        return false;
    };
    if e <= s + 1 {
        return false;
    }
    let between: Vec<NodeId> = siblings[s + 1..e].to_vec();

    info!(
        "Rebuilding managed container from {} node(s) between anchor macros",
        between.len()
    );
    let (container, generated) = create_container(doc);
    for node in between {
        doc.append_child(generated, node);
    }
    doc.insert_after(start, container);

    doc.clear_children(generated);
    install(doc, generated, inner_html);
    true
}

// ── State D ──

fn no_region(existing_html: &str, inner_html: &str, on_missing: OnMissing) -> MergeOutcome {
    let block = make_managed_block(inner_html);
    match on_missing {
        OnMissing::ReplaceAll => {
            info!("No managed region found, replacing the whole page body");
            MergeOutcome {
                html: block,
                path: MergePath::ReplacedAll,
            }
        }
        OnMissing::Append => {
            warn!(
                "No managed region found, appending a new one; if the host strips every marker, each run appends another copy"
            );
            let html = if existing_html.trim().is_empty() {
                block
            } else {
                format!("{}\n{}", existing_html, block)
            };
            MergeOutcome {
                html,
                path: MergePath::Appended,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generated_html(page: &str) -> String {
        let doc = Document::parse(page).unwrap();
        let g = doc.find(is_generated).unwrap();
        doc.inner_html(g)
    }

    fn container_count(page: &str) -> usize {
        let doc = Document::parse(page).unwrap();
        doc.descendants(Document::ROOT)
            .into_iter()
            .filter(|&id| doc.has_attr(id, MANAGED_ATTR))
            .count()
    }

    #[test]
    fn concrete_example() {
        let existing = r#"<div data-managed-region="true" class="auto-managed-region"><div data-generated-content="true" class="auto-generated-content"><table><row>old</row></table></div></div>"#;
        let out = upsert_managed_block(existing, "<table><row>new</row></table>", OnMissing::Append);
        assert_eq!(
            out,
            r#"<div data-managed-region="true" class="auto-managed-region"><div data-generated-content="true" class="auto-generated-content"><table><row>new</row></table></div></div>"#
        );
    }

    #[test]
    fn steady_state_is_idempotent() {
        let page = format!("<p>Intro</p>\n{}\n<p>Footer</p>", make_managed_block("<p>old</p>"));
        let inner = "<table><tr><td>suite A</td></tr></table>";
        let first = upsert_managed_block(&page, inner, OnMissing::Append);
        let second = upsert_managed_block(&first, inner, OnMissing::Append);
        assert_eq!(first, second);
        assert_eq!(generated_html(&second), inner);
        assert!(second.starts_with("<p>Intro</p>"));
        assert!(second.ends_with("<p>Footer</p>"));
    }

    #[test]
    fn repeated_merges_never_duplicate() {
        let mut page = make_managed_block("<p>0</p>");
        for i in 1..5 {
            let outcome = merge(&page, &format!("<p>{}</p>", i), OnMissing::Append);
            assert_eq!(outcome.path, MergePath::Container(Locator::Attribute));
            page = outcome.html;
        }
        assert_eq!(container_count(&page), 1);
        assert_eq!(generated_html(&page), "<p>4</p>");
    }

    #[test]
    fn human_siblings_inside_container_survive() {
        let page = r#"<div data-managed-region="true" class="auto-managed-region"><div data-generated-content="true" class="auto-generated-content"><p>old</p></div><p>Human note</p></div>"#;
        let out = upsert_managed_block(page, "<p>new</p>", OnMissing::Append);
        assert!(out.contains("<p>new</p></div><p>Human note</p></div>"));
        assert!(!out.contains("old"));
    }

    #[test]
    fn class_only_container_gets_markers_back() {
        let page = r#"<div class="auto-managed-region"><div class="auto-generated-content"><p>old</p></div></div>"#;
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Container(Locator::Class));
        assert_eq!(
            outcome.html,
            r#"<div class="auto-managed-region" data-managed-region="true"><div class="auto-generated-content" data-generated-content="true"><p>new</p></div></div>"#
        );
    }

    #[test]
    fn div_after_begin_comment() {
        let page = "<p>a</p><!-- BEGIN MANAGED REGION -->\n<div><p>old</p></div>\n<!-- END MANAGED REGION -->";
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Container(Locator::BeginCommentSibling));
        // Missing generated child is created first; existing children stay as siblings.
        assert!(outcome.html.contains(
            r#"<div data-managed-region="true" class="auto-managed-region"><div data-generated-content="true" class="auto-generated-content"><p>new</p></div><p>old</p></div>"#
        ));
    }

    #[test]
    fn begin_comment_search_stops_at_end_comment() {
        let page = "<!-- BEGIN MANAGED REGION --><p>x</p><!-- END MANAGED REGION --><div>human</div>";
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_ne!(outcome.path, MergePath::Container(Locator::BeginCommentSibling));
        assert_eq!(outcome.path, MergePath::Appended);
    }

    #[test]
    fn div_wrapping_begin_comment() {
        let page = "<div><!-- BEGIN MANAGED REGION --><p>old</p></div>";
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Container(Locator::CommentWrapper));
        assert_eq!(generated_html(&outcome.html), "<p>new</p>");
    }

    #[test]
    fn parent_of_generated_content() {
        let page = r#"<section><div data-generated-content="true"><p>old</p></div></section>"#;
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Container(Locator::GeneratedParent));
        assert_eq!(
            outcome.html,
            r#"<section data-managed-region="true" class="auto-managed-region"><div data-generated-content="true" class="auto-generated-content"><p>new</p></div></section>"#
        );
    }

    #[test]
    fn top_level_generated_content_gets_wrapped() {
        let page = r#"<p>a</p><div data-generated-content="true"><p>old</p></div><p>b</p>"#;
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Container(Locator::GeneratedParent));
        assert!(outcome.html.starts_with("<p>a</p><div data-managed-region=\"true\""));
        assert!(outcome.html.ends_with("</div></div><p>b</p>"));
        assert_eq!(container_count(&outcome.html), 1);
    }

    #[test]
    fn rebuild_between_anchor_macros() {
        let page = format!(
            "<p>top</p>{}<p>stale</p><table><tr><td>old</td></tr></table>{}<p>bottom</p>",
            anchor_macro(ANCHOR_START),
            anchor_macro(ANCHOR_END)
        );
        let outcome = merge(&page, "<p>X</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::AnchorReconstruct);
        assert_eq!(container_count(&outcome.html), 1);
        assert_eq!(generated_html(&outcome.html), "<p>X</p>");
        assert!(!outcome.html.contains("stale"));
        assert!(!outcome.html.contains("old"));
        assert!(outcome.html.starts_with("<p>top</p>"));
        assert!(outcome.html.ends_with("<p>bottom</p>"));
    }

    #[test]
    fn rebuild_between_paragraph_wrapped_anchors() {
        let page = format!(
            "<p>{}</p><p>stale</p><p>{}</p>",
            anchor_macro(ANCHOR_START),
            anchor_macro(ANCHOR_END)
        );
        let outcome = merge(&page, "<p>X</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::AnchorReconstruct);
        assert_eq!(generated_html(&outcome.html), "<p>X</p>");
        // Container lands between the two paragraphs, not inside the first.
        assert!(outcome.html.contains("</ac:structured-macro></p><div data-managed-region"));
    }

    #[test]
    fn adjacent_anchors_fall_through() {
        let page = format!("{}{}", anchor_macro(ANCHOR_START), anchor_macro(ANCHOR_END));
        let outcome = merge(&page, "<p>X</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Appended);
    }

    #[test]
    fn legacy_block_is_migrated() {
        let page = "<!-- BEGIN AUTO-GENERATED --><table><tr><td>old</td></tr></table><p>Some note</p><!-- END AUTO-GENERATED -->";
        let outcome = merge(page, "<table><tr><td>new</td></tr></table>", OnMissing::ReplaceAll);
        assert_eq!(outcome.path, MergePath::LegacyMigration);
        assert_eq!(generated_html(&outcome.html), "<table><tr><td>new</td></tr></table>");
        assert!(outcome.html.contains("<p>Some note</p>"));
        assert!(!outcome.html.contains("old"));

        // Next run takes the steady-state path.
        let next = merge(&outcome.html, "<p>later</p>", OnMissing::ReplaceAll);
        assert_eq!(next.path, MergePath::Container(Locator::Attribute));
        assert!(next.html.contains("<p>Some note</p>"));
    }

    #[test]
    fn replace_all_discards_page() {
        let outcome = merge("<p>human</p>", "<p>x</p>", OnMissing::ReplaceAll);
        assert_eq!(outcome.path, MergePath::ReplacedAll);
        assert_eq!(outcome.html, make_managed_block("<p>x</p>"));
    }

    #[test]
    fn append_keeps_existing_content() {
        let outcome = merge("<p>human</p>", "<p>x</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Appended);
        assert_eq!(outcome.html, format!("<p>human</p>\n{}", make_managed_block("<p>x</p>")));
    }

    #[test]
    fn append_to_empty_page_twice_yields_two_blocks() {
        let first = upsert_managed_block("", "<p>a</p>", OnMissing::Append);
        let second = upsert_managed_block("", "<p>b</p>", OnMissing::Append);
        assert_eq!(first, make_managed_block("<p>a</p>"));
        let page = format!("{}\n{}", first, second);
        assert_eq!(page.matches(&managed_attr_marker()).count(), 2);
        assert_eq!(container_count(&page), 2);
    }

    #[test]
    fn unparseable_page_falls_through_to_append() {
        let page = "<p>x</p><!-- unterminated";
        let outcome = merge(page, "<p>new</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Appended);
        assert!(outcome.html.starts_with(page));
    }

    #[test]
    fn bare_less_than_leaves_page_intact() {
        let page = format!("<p>a < b</p>\n{}", make_managed_block("<p>old</p>"));
        let outcome = merge(&page, "<p>NEW</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Appended);
        assert!(!outcome.html.contains("</>"));
        assert!(!outcome.html.contains("</p=\"\">"));
        assert_eq!(outcome.html, format!("{}\n{}", page, make_managed_block("<p>NEW</p>")));
    }

    #[test]
    fn unparseable_fragment_inserted_verbatim() {
        let page = make_managed_block("<p>old</p>");
        let out = upsert_managed_block(&page, "<p>a</p><!-- oops", OnMissing::Append);
        assert!(out.contains("<p>a</p><!-- oops"));
        assert!(!out.contains("<p>old</p>"));
    }

    #[test]
    fn steady_state_fixture_keeps_notes() {
        let html = std::fs::read_to_string("tests/fixtures/steady_state.html").unwrap();
        let inner = "<table><tbody><tr><th>Suite</th></tr><tr><td>Checkout</td></tr></tbody></table>";
        let first = merge(&html, inner, OnMissing::Append);
        assert_eq!(first.path, MergePath::Container(Locator::Attribute));
        assert!(first.html.contains("Please re-run the payment suite"));
        assert!(first.html.contains("Known issues are tracked in QA-1234"));
        assert!(!first.html.contains("Login"));
        assert_eq!(generated_html(&first.html), inner);
        let second = upsert_managed_block(&first.html, inner, OnMissing::Append);
        assert_eq!(first.html, second);
    }

    #[test]
    fn stripped_fixture_recovered_by_class() {
        let html = std::fs::read_to_string("tests/fixtures/stripped_page.html").unwrap();
        let outcome = merge(&html, "<p>fresh</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::Container(Locator::Class));
        assert_eq!(container_count(&outcome.html), 1);
        assert_eq!(generated_html(&outcome.html), "<p>fresh</p>");
    }

    #[test]
    fn anchors_fixture_rebuilt() {
        let html = std::fs::read_to_string("tests/fixtures/anchors_only.html").unwrap();
        let outcome = merge(&html, "<p>X</p>", OnMissing::Append);
        assert_eq!(outcome.path, MergePath::AnchorReconstruct);
        assert_eq!(generated_html(&outcome.html), "<p>X</p>");
        assert!(outcome.html.contains("Release owner"));
    }

    #[test]
    fn merge_path_labels() {
        assert_eq!(MergePath::Container(Locator::Attribute).to_string(), "container:attribute");
        assert_eq!(MergePath::AnchorReconstruct.to_string(), "anchor_reconstruct");
        assert_eq!(MergePath::Appended.to_string(), "appended");
    }
}
