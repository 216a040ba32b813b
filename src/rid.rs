//! Resource ids: dot-separated strings naming a server-side resource, e.g.
//! `service.type.instance`.

/// Returns the type prefix of a resource id: its first two dot-segments, or
/// the whole id if it has fewer than two segments.
///
/// `"user.42"` -> `"user.42"`, `"user.42.settings"` -> `"user.42"`,
/// `"user"` -> `"user"`.
pub fn type_prefix(rid: &str) -> &str {
    match rid.match_indices('.').nth(1) {
        Some((idx, _)) => &rid[..idx],
        None => rid,
    }
}

/// Splits a dotted event path on its *last* segment, returning `(rid, name)`.
///
/// Returns `None` if there is no `.` in `path`, or the trailing segment is
/// empty (`"foo."`).
pub fn split_last_segment(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('.')?;
    let (rid, rest) = path.split_at(idx);
    let name = &rest[1..];
    if name.is_empty() {
        return None;
    }
    Some((rid, name))
}

/// A model-type id of the form `segment.segment`, validated at registration
/// time.
pub fn is_valid_model_type_id(id: &str) -> bool {
    let mut parts = id.split('.');
    let (first, second, third) = (parts.next(), parts.next(), parts.next());
    matches!((first, second, third), (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty())
}
