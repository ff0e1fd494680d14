//! Ordered header lists.
//!
//! Headers are `(name, value)` pairs: names preserve their wire casing and
//! compare case-insensitively, and the list preserves arrival order, which
//! `http::HeaderMap` cannot express for the merge semantics below.

/// First value for `name`, comparing case-insensitively.
pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether any value for `name` contains `token` in its comma-separated
/// list.
pub(crate) fn header_contains_token(
    headers: &[(String, String)],
    name: &str,
    token: &str,
) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .any(|(_, v)| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

/// Merge duplicate response headers into a single `", "`-joined value in
/// first-seen order, keeping the first-seen name casing. `Set-Cookie` is
/// exempt: its values are not list-safe, so each entry is preserved.
pub(crate) fn merge_response_headers(raw: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::with_capacity(raw.len());

    for (name, value) in raw {
        if name.eq_ignore_ascii_case("set-cookie") {
            merged.push((name, value));
            continue;
        }

        match merged
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => merged.push((name, value)),
        }
    }

    merged
}
