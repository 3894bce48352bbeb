//! `application/x-www-form-urlencoded` bodies.

use std::collections::BTreeMap;

/// Decoded form fields, ordered by key so responses are deterministic.
pub type FormData = BTreeMap<String, String>;

/// Decode `key=value&key=value` pairs. Percent escapes are resolved and `+`
/// becomes a space; a repeated key keeps its last value. Segments without an
/// `=` are skipped.
pub fn parse(body: &[u8]) -> Result<FormData, serde_urlencoded::de::Error> {
    let pairs: Vec<&[u8]> = body
        .split(|&b| b == b'&')
        .filter(|segment| segment.contains(&b'='))
        .collect();
    let decoded: Vec<(String, String)> = serde_urlencoded::from_bytes(&pairs.join(&b'&'))?;
    Ok(decoded.into_iter().collect())
}

/// Inverse of [`parse`] for well-formed maps.
pub fn encode(data: &FormData) -> Result<String, serde_urlencoded::ser::Error> {
    serde_urlencoded::to_string(data)
}

/// Plain-text enumeration of the decoded pairs, one per line.
pub fn describe(data: &FormData) -> String {
    let mut out = String::from("Received POST data:\n");
    for (key, value) in data {
        out.push_str("    ");
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}
