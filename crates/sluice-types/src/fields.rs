//! Field codec for the line-oriented checkpoint format.
//!
//! Checkpoint records are one line per entity: tab-separated fields, first
//! field is the entity type tag. String fields that may contain the field
//! separator (program text, file paths) are backslash-escaped; list fields
//! are comma-joined escaped elements.

/// Escape a string value so it can be embedded as a single record field.
pub fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ',' => out.push_str("\\c"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reverse of [`encode`]. Unknown escape sequences pass through verbatim.
pub fn decode(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(','),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Encode a list of strings as a single comma-joined field.
/// The empty list encodes as the empty field.
pub fn encode_list<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(|v| encode(v.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a comma-joined field back into a list. The empty field decodes to
/// the empty list.
pub fn decode_list(field: &str) -> Vec<String> {
    if field.is_empty() {
        return Vec::new();
    }
    field.split(',').map(decode).collect()
}

/// Split one checkpoint line into raw (still escaped) fields.
pub fn split_record(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}
