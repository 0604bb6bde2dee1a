//! Text normalization for survey headers and cell values.
//!
//! Survey questions arrive in many languages (French, Turkish, Russian,
//! Vietnamese...). `normalize` folds them to a stable ASCII form so they can be
//! used as record keys.

use deunicode::deunicode_with_tofu;

/// Transliterates `text` to ASCII, drops embedded newlines and trims.
///
/// Total and deterministic. Characters with no ASCII approximation are dropped
/// or replaced by the closest available form. The output is always a fixed
/// point: `normalize(&normalize(s)) == normalize(s)`.
pub fn normalize(text: &str) -> String {
    let without_newlines: String = text.chars().filter(|c| *c != '\n').collect();
    let ascii = deunicode_with_tofu(&without_newlines, "");
    // The transliteration table can itself emit line breaks for a few
    // separators, so strip again on the ASCII side.
    let ascii: String = ascii.chars().filter(|c| *c != '\n').collect();
    ascii.trim().to_string()
}
