use tracing::debug;

use super::dom::{Document, NodeId};
use super::markers::*;

/// One independent signal that a page already carries a managed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    DataAttribute,
    CommentPair,
    AnchorPair,
    CssClass,
    Structure,
}

impl Marker {
    /// Evaluation order: cheapest and most reliable first.
    pub const ALL: [Marker; 5] = [
        Marker::DataAttribute,
        Marker::CommentPair,
        Marker::AnchorPair,
        Marker::CssClass,
        Marker::Structure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Marker::DataAttribute => "data attribute",
            Marker::CommentPair => "comment pair",
            Marker::AnchorPair => "anchor macros",
            Marker::CssClass => "css class",
            Marker::Structure => "structure",
        }
    }

    pub fn matches(self, html: &str) -> bool {
        match self {
            Marker::DataAttribute => html.contains(&managed_attr_marker()),
            Marker::CommentPair => html.contains(&begin_comment()) && html.contains(&end_comment()),
            Marker::AnchorPair => html.contains(ANCHOR_START) && html.contains(ANCHOR_END),
            Marker::CssClass => html.contains(MANAGED_CLASS) || html.contains(GENERATED_CLASS),
            Marker::Structure => match Document::parse(html) {
                Ok(doc) => doc.find(is_structural_marker).is_some(),
                Err(e) => {
                    debug!("Structural marker search skipped, page did not parse: {:#}", e);
                    false
                }
            },
        }
    }
}

fn is_structural_marker(doc: &Document, id: NodeId) -> bool {
    doc.has_attr(id, MANAGED_ATTR)
        || doc.has_class(id, MANAGED_CLASS)
        || (doc.is_element(id, ANCHOR_PARAM) && doc.text_content(id).trim() == ANCHOR_START)
}

/// First marker layer that recognizes a managed region in `html`.
pub fn detect_marker(html: &str) -> Option<Marker> {
    let found = Marker::ALL.into_iter().find(|m| m.matches(html));
    if found.is_none() {
        debug!(
            "No managed region: none of {} marker layers matched ({} bytes)",
            Marker::ALL.len(),
            html.len()
        );
    }
    found
}

pub fn has_managed_block(html: &str) -> bool {
    detect_marker(html).is_some()
}
