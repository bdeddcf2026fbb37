/// Matches a dot-separated routing key against a topic binding pattern
///
/// Within a pattern, `*` substitutes exactly one segment and `#` substitutes zero or more segments.
pub fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    matches_segments(&pattern, &key)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..])),
        Some((&segment, rest)) => match key.split_first() {
            Some((&word, remaining)) if segment == "*" || segment == word => {
                matches_segments(rest, remaining)
            }
            _ => false,
        },
    }
}
