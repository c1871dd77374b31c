//! Post-stream repair of an accumulated assistant message.

pub mod dedup;
pub mod formula;
pub mod legacy;

pub use dedup::{remove_duplicate_content, similarity};
pub use formula::{has_formula_markup, normalize_formulas};
pub use legacy::repair_legacy_math;

/// Produces the display text for a completed turn.
///
/// Duplicates are removed before math normalization. Text without
/// `<<< >>>` markup also goes through the legacy repair pass first.
pub fn finalize_response(text: &str) -> String {
    let deduped = remove_duplicate_content(text);
    if has_formula_markup(&deduped) {
        normalize_formulas(&deduped)
    } else {
        normalize_formulas(&repair_legacy_math(&deduped))
    }
}
