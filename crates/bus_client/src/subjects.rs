//! Subject matching with NATS wildcard semantics.
//!
//! `*` matches exactly one token, `>` matches one or more trailing tokens.

use crate::error::{BusError, Result};

/// Check whether `subject` is matched by `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subject usable for publishing: non-empty tokens, no wildcards.
pub fn valid_publish_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|tok| !tok.is_empty() && tok != "*" && tok != ">")
}

/// Guard applied by every publish path before the message reaches the
/// transport.
pub fn ensure_publish_subject(subject: &str) -> Result<()> {
    if valid_publish_subject(subject) {
        Ok(())
    } else {
        Err(BusError::InvalidSubject(subject.to_string()))
    }
}
