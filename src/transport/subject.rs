//! Subject matching and name validation

/// Check whether `subject` is matched by `pattern`
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check whether two subject patterns can match a common subject
pub fn overlaps(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => continue,
            (Some(x), Some(y)) if x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a stream or consumer name
///
/// Names become subject tokens in the JetStream API, so they must not
/// contain separators, wildcards or whitespace.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.chars().any(char::is_whitespace) {
        return Err("name contains whitespace");
    }
    if name.contains(['.', '*', '>', '/', '\\']) {
        return Err("name contains '.', '*', '>' or a path separator");
    }
    Ok(())
}

/// Validate a concrete publish subject (no wildcards, no empty tokens)
pub fn validate_publish_subject(subject: &str) -> Result<(), &'static str> {
    if subject.is_empty() {
        return Err("subject is empty");
    }
    if subject.chars().any(char::is_whitespace) {
        return Err("subject contains whitespace");
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err("subject contains an empty token");
        }
        if token == "*" || token == ">" {
            return Err("subject contains a wildcard");
        }
    }
    Ok(())
}
