//! `Authentication-Results` (RFC 8601) assembly.
//!
//! The assembler is deterministic: the same fragment list, in the same
//! order, yields byte-identical output. Method ordering mirrors
//! handler execution order because fragments are appended in call
//! order.

use crate::context::AuthFragment;

/// Collapse runs of whitespace (including folded-header newlines) into
/// single spaces and trim the ends.
fn normalize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_space = true;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Format one fragment as `method=result (comment) key=value ...`.
fn format_fragment(fragment: &AuthFragment) -> String {
    let mut out = format!(
        "{}={}",
        normalize(&fragment.method),
        normalize(&fragment.result)
    );

    if let Some(comment) = &fragment.comment {
        let comment = normalize(comment);
        if !comment.is_empty() {
            out.push_str(" (");
            out.push_str(&comment);
            out.push(')');
        }
    }

    for (key, value) in &fragment.properties {
        out.push(' ');
        out.push_str(&normalize(key));
        out.push('=');
        out.push_str(&normalize(value));
    }

    out
}

/// Assemble the single `Authentication-Results` header value.
///
/// Multiple fragments for one method (several DKIM signatures, say)
/// stay as separate semicolon-delimited entries with identical
/// `method=` tokens. An empty fragment list yields `<server-id>; none`.
#[must_use]
pub fn assemble(server_id: &str, fragments: &[AuthFragment]) -> String {
    if fragments.is_empty() {
        return format!("{server_id}; none");
    }

    let mut out = String::from(server_id);
    for fragment in fragments {
        out.push_str("; ");
        out.push_str(&format_fragment(fragment));
    }
    out
}
