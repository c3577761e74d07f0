//! Marker vocabulary for the managed region and the canonical block builder.
//!
//! Every marker is written redundantly so the region can still be found after
//! Confluence strips some of them on save.

pub const MANAGED_ATTR: &str = "data-managed-region";
pub const GENERATED_ATTR: &str = "data-generated-content";
pub const MANAGED_CLASS: &str = "auto-managed-region";
pub const GENERATED_CLASS: &str = "auto-generated-content";

/// Comment bodies as they appear between `<!--` and `-->`.
pub const BEGIN_COMMENT: &str = " BEGIN MANAGED REGION ";
pub const END_COMMENT: &str = " END MANAGED REGION ";

pub const ANCHOR_START: &str = "managed-region-start";
pub const ANCHOR_END: &str = "managed-region-end";

pub const ANCHOR_MACRO: &str = "ac:structured-macro";
pub const ANCHOR_PARAM: &str = "ac:parameter";

pub fn managed_attr_marker() -> String {
    format!("{}=\"true\"", MANAGED_ATTR)
}

pub fn begin_comment() -> String {
    format!("<!--{}-->", BEGIN_COMMENT)
}

pub fn end_comment() -> String {
    format!("<!--{}-->", END_COMMENT)
}

pub fn is_begin_comment(text: &str) -> bool {
    text.trim() == BEGIN_COMMENT.trim()
}

pub fn is_end_comment(text: &str) -> bool {
    text.trim() == END_COMMENT.trim()
}

pub fn anchor_macro(name: &str) -> String {
    format!(
        r#"<{m} ac:name="anchor" ac:schema-version="1"><{p} ac:name="">{name}</{p}></{m}>"#,
        m = ANCHOR_MACRO,
        p = ANCHOR_PARAM,
        name = name,
    )
}

pub fn container_open() -> String {
    format!(r#"<div {}="true" class="{}">"#, MANAGED_ATTR, MANAGED_CLASS)
}

pub fn generated_open() -> String {
    format!(r#"<div {}="true" class="{}">"#, GENERATED_ATTR, GENERATED_CLASS)
}

/// Build a complete managed region around `inner_html`:
/// begin comment, start anchor, container > generated content, end anchor,
/// end comment.
pub fn make_managed_block(inner_html: &str) -> String {
    [
        begin_comment(),
        anchor_macro(ANCHOR_START),
        format!("{}{}{}</div></div>", container_open(), generated_open(), inner_html),
        anchor_macro(ANCHOR_END),
        end_comment(),
    ]
    .join("\n")
}
