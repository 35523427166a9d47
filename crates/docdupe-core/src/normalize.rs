//! OCR text normalization.

/// Canonicalize raw OCR text.
///
/// Lower-cases, removes every character that is neither alphanumeric nor
/// whitespace, collapses whitespace runs to a single space, and trims.
/// `None` and empty input both yield an empty string.
///
/// ```rust
/// use docdupe_core::normalize::normalize_text;
///
/// assert_eq!(normalize_text(Some("  Invoice #12345\n\tTOTAL: $500 ")), "invoice 12345 total 500");
/// assert_eq!(normalize_text(None), "");
/// ```
pub fn normalize_text(text: Option<&str>) -> String {
    let text = match text {
        Some(t) if !t.is_empty() => t,
        _ => return String::new(),
    };

    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else if c.is_alphanumeric() {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}
