use std::ops::Range;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use super::dom::Document;
use super::markers::{anchor_macro, begin_comment, end_comment, make_managed_block, ANCHOR_END, ANCHOR_START};
use super::merge::{create_container, install};

/// Pre-multi-marker format: a bare comment pair, optionally qualified
/// (`<!-- BEGIN AUTO-GENERATED:suites -->`).
static LEGACY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--\s*BEGIN AUTO-GENERATED(?::\s*(?P<qual>[^>]*?))?\s*-->(?P<inner>.*?)<!--\s*END AUTO-GENERATED(?::[^>]*?)?\s*-->",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySpan {
    pub range: Range<usize>,
    pub inner: String,
    pub qualifier: Option<String>,
}

pub fn find_legacy_span(html: &str) -> Option<LegacySpan> {
    let caps = LEGACY_RE.captures(html)?;
    let whole = caps.get(0)?;
    Some(LegacySpan {
        range: whole.range(),
        inner: caps.name("inner").map_or("", |m| m.as_str()).to_string(),
        qualifier: caps
            .name("qual")
            .map(|m| m.as_str().trim().to_string())
            .filter(|q| !q.is_empty()),
    })
}

pub fn has_legacy_block(html: &str) -> bool {
    LEGACY_RE.is_match(html)
}

/// Replace the legacy span with a canonical block holding `inner_html`.
/// Top-level tables inside the old span were generated and are dropped;
/// every other top-level node is a human edit and moves into the new
/// container after the generated content.
pub fn migrate_legacy_block(html: &str, span: &LegacySpan, inner_html: &str) -> String {
    let replacement = match rebuild_with_preserved(&span.inner, inner_html) {
        Ok((block, kept)) => {
            info!(
                "Migrated legacy block{} ({} human node(s) preserved)",
                span.qualifier
                    .as_deref()
                    .map(|q| format!(" '{}'", q))
                    .unwrap_or_default(),
                kept
            );
            block
        }
        Err(e) => {
            warn!(
                "Legacy block could not be rebuilt, replacing it wholesale; human edits inside it are lost: {:#}",
                e
            );
            make_managed_block(inner_html)
        }
    };

    let mut out = String::with_capacity(html.len() + replacement.len());
    out.push_str(&html[..span.range.start]);
    out.push_str(&replacement);
    out.push_str(&html[span.range.end..]);
    out
}

fn rebuild_with_preserved(legacy_inner: &str, inner_html: &str) -> Result<(String, usize)> {
    let old = Document::parse(legacy_inner).context("legacy block content")?;

    let mut block = Document::new();
    block.append_html(
        Document::ROOT,
        &format!("{}\n{}\n", begin_comment(), anchor_macro(ANCHOR_START)),
    )?;
    let (container, generated) = create_container(&mut block);
    block.append_child(Document::ROOT, container);
    install(&mut block, generated, inner_html);

    let mut kept = 0;
    for &top in old.children(Document::ROOT) {
        if old.is_element(top, "table") || old.is_blank_text(top) {
            continue;
        }
        let node = block.adopt(&old, top);
        block.append_child(container, node);
        kept += 1;
    }

    block.append_html(
        Document::ROOT,
        &format!("\n{}\n{}", anchor_macro(ANCHOR_END), end_comment()),
    )?;
    Ok((block.serialize(), kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::detect::has_managed_block;

    const LEGACY: &str = "<p>Intro</p>\n<!-- BEGIN AUTO-GENERATED -->\n<table><tr><td>old</td></tr></table>\n<p>Some note</p>\n<!-- END AUTO-GENERATED -->\n<p>Outro</p>";

    #[test]
    fn finds_plain_span() {
        let span = find_legacy_span(LEGACY).unwrap();
        assert!(span.inner.contains("<p>Some note</p>"));
        assert_eq!(span.qualifier, None);
        assert!(LEGACY[span.range.clone()].starts_with("<!-- BEGIN AUTO-GENERATED -->"));
    }

    #[test]
    fn finds_qualified_span() {
        let html = "<!-- BEGIN AUTO-GENERATED: suite-tables --><p>a</p><!-- END AUTO-GENERATED:suite-tables -->";
        let span = find_legacy_span(html).unwrap();
        assert_eq!(span.qualifier.as_deref(), Some("suite-tables"));
        assert_eq!(span.inner, "<p>a</p>");
    }

    #[test]
    fn no_span_in_plain_page() {
        assert!(find_legacy_span("<p>nothing</p>").is_none());
        assert!(!has_legacy_block("<!-- BEGIN AUTO-GENERATED --> dangling"));
    }

    #[test]
    fn migration_keeps_human_nodes_and_drops_tables() {
        let span = find_legacy_span(LEGACY).unwrap();
        let out = migrate_legacy_block(LEGACY, &span, "<table><tr><td>new</td></tr></table>");
        assert!(out.contains("<table><tr><td>new</td></tr></table>"));
        assert!(out.contains("<p>Some note</p>"));
        assert!(!out.contains("old"));
        assert!(!out.contains("AUTO-GENERATED"));
        assert!(out.starts_with("<p>Intro</p>"));
        assert!(out.ends_with("<p>Outro</p>"));
        // Note sits inside the container, after the generated child.
        assert!(out.contains("<table><tr><td>new</td></tr></table></div><p>Some note</p></div>"));
        assert!(has_managed_block(&out));
    }

    #[test]
    fn only_first_span_migrated() {
        let html = "<!-- BEGIN AUTO-GENERATED --><table></table><!-- END AUTO-GENERATED -->\n<!-- BEGIN AUTO-GENERATED --><table></table><!-- END AUTO-GENERATED -->";
        let span = find_legacy_span(html).unwrap();
        let out = migrate_legacy_block(html, &span, "<p>x</p>");
        assert_eq!(out.matches("BEGIN AUTO-GENERATED").count(), 1);
        assert_eq!(out.matches("data-managed-region=\"true\"").count(), 1);
    }

    #[test]
    fn unparseable_legacy_content_replaced_wholesale() {
        let html = "<p>a</p><!-- BEGIN AUTO-GENERATED --><p>note</p><!-- broken <!-- END AUTO-GENERATED -->";
        let span = find_legacy_span(html).unwrap();
        let out = migrate_legacy_block(html, &span, "<p>x</p>");
        assert_eq!(out, format!("<p>a</p>{}", make_managed_block("<p>x</p>")));
    }

    #[test]
    fn rebuilt_block_matches_canonical_block() {
        let html = "<!-- BEGIN AUTO-GENERATED --><table></table><!-- END AUTO-GENERATED -->";
        let span = find_legacy_span(html).unwrap();
        let out = migrate_legacy_block(html, &span, "<p>x</p>");
        assert_eq!(out, make_managed_block("<p>x</p>"));
    }

    #[test]
    fn unparseable_fragment_kept_verbatim_during_migration() {
        let span = find_legacy_span(LEGACY).unwrap();
        let out = migrate_legacy_block(LEGACY, &span, "<p>a</p><!-- oops");
        assert!(out.contains("<p>a</p><!-- oops</div><p>Some note</p></div>"));
        assert!(out.contains(&end_comment()));
        assert!(out.ends_with("<p>Outro</p>"));
    }

    #[test]
    fn legacy_fixture() {
        let html = std::fs::read_to_string("tests/fixtures/legacy_page.html").unwrap();
        let span = find_legacy_span(&html).unwrap();
        assert_eq!(span.qualifier.as_deref(), Some("regression"));
        let out = migrate_legacy_block(&html, &span, "<p>fresh</p>");
        assert!(out.contains("<p>fresh</p>"));
        assert!(out.contains("Flaky on Android 14"));
        assert!(!out.contains("Nightly Regression Suite"));
    }
}
