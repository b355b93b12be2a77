use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left untouched by the wire encoding, beyond alphanumerics.
///
/// Matches the unreserved set of RFC 3986; notably `_` is never encoded
/// because the session tag format relies on it as a separator.
const WIRE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encodes a value for use in a key=value beacon field.
pub fn encode_value(value: &str) -> String {
    utf8_percent_encode(value, WIRE_SET).to_string()
}

/// Appends `&key=` to `out`, omitting the `&` when the buffer is empty.
pub fn append_key(out: &mut String, key: &str) {
    if !out.is_empty() {
        out.push('&');
    }
    out.push_str(key);
    out.push('=');
}

/// Appends a key with a percent-encoded string value.
pub fn append_str(out: &mut String, key: &str, value: &str) {
    append_key(out, key);
    out.push_str(&encode_value(value));
}

/// Appends a key with a numeric value (no encoding needed).
pub fn append_num<T: std::fmt::Display>(out: &mut String, key: &str, value: T) {
    append_key(out, key);
    out.push_str(&value.to_string());
}

/// Trims surrounding whitespace and truncates to `max_len` characters.
pub fn truncate_name(name: &str, max_len: usize) -> &str {
    let trimmed = name.trim();
    match trimmed.char_indices().nth(max_len) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}
