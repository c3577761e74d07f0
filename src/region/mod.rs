pub mod detect;
pub mod dom;
pub mod legacy;
pub mod markers;
pub mod merge;

pub use detect::{detect_marker, has_managed_block, Marker};
pub use legacy::has_legacy_block;
pub use markers::make_managed_block;
pub use merge::{merge, upsert_managed_block, MergeOutcome, MergePath, OnMissing};
