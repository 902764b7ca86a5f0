use std::ascii;

/// Renders raw protocol bytes printably for logs, escaping CR, LF and any
/// non-ASCII bytes.
pub(crate) fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}
