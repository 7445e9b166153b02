//! Tag-set parsing for member records.
//!
//! Serf prints tags as `k=v,k=v` without escaping, so values may contain
//! both `,` and `=`. The parser groups tokens greedily: a `,` closes a pair
//! only when it is not followed by another `,`, and a group without any `=`
//! is glued onto the previous pair.
//!
//! Known limitation: the grouping is a heuristic. Values ending in `=` or
//! containing `,k=` sequences cannot be told apart from a following pair.

use std::collections::BTreeMap;

/// Parse a tag-set string into a map.
///
/// `"aa=b=,,c=d,e=f,g,h,i=j"` parses to
/// `{aa: "b=,", c: "d", e: "f,g,h", i: "j"}`.
pub fn parse_tags(input: &str) -> BTreeMap<String, String> {
    let tokens = tokenize(input);

    let mut groups: Vec<Vec<&str>> = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        buffer.push(token);
        if token == "," && iter.peek() != Some(&",") && buffer.len() >= 2 {
            groups.push(std::mem::take(&mut buffer));
        }
    }
    if !buffer.is_empty() {
        groups.push(buffer);
    }

    let mut pairs: Vec<Vec<&str>> = Vec::with_capacity(groups.len());
    for group in groups {
        match pairs.last_mut() {
            Some(last) if !group.contains(&"=") => last.extend(group),
            _ => pairs.push(group),
        }
    }

    pairs
        .into_iter()
        .map(|mut pair| {
            // trailing separator
            pair.pop();
            let joined = pair.concat();
            match joined.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (joined, String::new()),
            }
        })
        .collect()
}

/// Split into alternating content and separator tokens.
///
/// Content is at least one character, extended up to the next `,` or `=`;
/// the separator is that character, or empty at end of input.
fn tokenize(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while let Some(first) = rest.chars().next() {
        let head = first.len_utf8();
        let content_end = rest[head..]
            .find(|c: char| c == ',' || c == '=')
            .map_or(rest.len(), |offset| head + offset);
        tokens.push(&rest[..content_end]);

        let after = &rest[content_end..];
        if after.is_empty() {
            tokens.push("");
            rest = after;
        } else {
            tokens.push(&after[..1]);
            rest = &after[1..];
        }
    }
    tokens
}
