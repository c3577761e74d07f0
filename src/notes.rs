use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::region::markers::make_managed_block;

pub const NOTES_ATTR: &str = "data-notes-region";

/// `<h3>Notes</h3>` + human notes div + `<hr/>`; the managed block follows it.
static SPACER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<h3>\s*Notes\s*</h3>\s*(?P<open><div\b[^>]*>).*?</div>\s*<hr\s*/?>").unwrap()
});
static STALE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<table\b|<h[1-6]\b").unwrap());
/// Oldest page layout: a heading directly followed by a generated table.
static OLD_HEADING_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<h[1-6][^>]*>[^<]*(?:<(?:strong|em|b|i|span|code)\b[^>]*>[^<]*</(?:strong|em|b|i|span|code)>[^<]*)*</h[1-6]>\s*<table\b.*?</table>\s*",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotesSpacer {
    pub range: Range<usize>,
    div_open: Range<usize>,
    pub has_region_attr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupKind {
    ReplacedStale,
    InsertedAfterSpacer,
    CreatedNotes,
}

impl fmt::Display for SetupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetupKind::ReplacedStale => "replaced_stale",
            SetupKind::InsertedAfterSpacer => "inserted_after_spacer",
            SetupKind::CreatedNotes => "created_notes",
        })
    }
}

#[derive(Debug, Clone)]
pub struct FirstRun {
    pub html: String,
    pub kind: SetupKind,
    pub healed: bool,
}

pub fn notes_section() -> String {
    format!(
        "<h3>Notes</h3>\n<div {}=\"true\"><p>Add release notes and context in this section. Everything below the line is generated automatically and replaced on every sync.</p></div>\n<hr/>",
        NOTES_ATTR
    )
}

pub fn find_notes_spacer(html: &str) -> Option<NotesSpacer> {
    let caps = SPACER_RE.captures(html)?;
    let whole = caps.get(0)?;
    let open = caps.name("open")?;
    Some(NotesSpacer {
        range: whole.range(),
        div_open: open.range(),
        has_region_attr: open.as_str().contains(NOTES_ATTR),
    })
}

/// Put the notes attribute back on the spacer div if the host stripped it.
/// Returns the new page and the spacer shifted to match.
pub fn heal_spacer(html: &str, spacer: &NotesSpacer) -> (String, NotesSpacer) {
    if spacer.has_region_attr {
        return (html.to_string(), spacer.clone());
    }
    warn!("Notes spacer lost its {} attribute, restoring it", NOTES_ATTR);

    let attr = format!(" {}=\"true\"", NOTES_ATTR);
    let at = spacer.div_open.start + "<div".len();
    let mut out = String::with_capacity(html.len() + attr.len());
    out.push_str(&html[..at]);
    out.push_str(&attr);
    out.push_str(&html[at..]);

    let shifted = NotesSpacer {
        range: spacer.range.start..spacer.range.end + attr.len(),
        div_open: spacer.div_open.start..spacer.div_open.end + attr.len(),
        has_region_attr: true,
    };
    (out, shifted)
}

/// Lay out a page that has no managed region yet.
pub fn first_run_setup(existing_html: &str, inner_html: &str) -> FirstRun {
    let block = make_managed_block(inner_html);

    if let Some(spacer) = find_notes_spacer(existing_html) {
        let healed = !spacer.has_region_attr;
        let (html, spacer) = heal_spacer(existing_html, &spacer);
        let (head, after) = html.split_at(spacer.range.end);

        if STALE_RE.is_match(after) {
            info!("Replacing stale generated content below the Notes section");
            return FirstRun {
                html: format!("{}\n{}", head, block),
                kind: SetupKind::ReplacedStale,
                healed,
            };
        }
        info!("Inserting managed region below the Notes section");
        return FirstRun {
            html: format!("{}\n{}{}", head, block, after),
            kind: SetupKind::InsertedAfterSpacer,
            healed,
        };
    }

    let removed = OLD_HEADING_TABLE_RE.find_iter(existing_html).count();
    if removed > 0 {
        info!("Removing {} old heading+table block(s)", removed);
    }
    let stripped = OLD_HEADING_TABLE_RE.replace_all(existing_html, "");
    let base = stripped.trim_end();

    info!("Creating Notes section and managed region");
    let html = if base.is_empty() {
        format!("{}\n{}", notes_section(), block)
    } else {
        format!("{}\n{}\n{}", base, notes_section(), block)
    };
    FirstRun {
        html,
        kind: SetupKind::CreatedNotes,
        healed: false,
    }
}
