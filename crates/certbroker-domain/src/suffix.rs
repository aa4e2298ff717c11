//! Name hierarchy helpers
//!
//! The hierarchy is plain string suffix matching on label boundaries:
//! `b` descends from `a` iff `b` ends with `"." + a`. Matching is
//! case-sensitive; names are lowercased once, on the way in, by
//! [`normalize_fqdn`].

use crate::error::DomainError;

/// `name` is a proper descendant of `parent`
pub fn is_descendant(name: &str, parent: &str) -> bool {
    !parent.is_empty()
        && name.len() > parent.len() + 1
        && name.ends_with(parent)
        && name.as_bytes()[name.len() - parent.len() - 1] == b'.'
}

pub fn is_same_or_descendant(name: &str, parent: &str) -> bool {
    name == parent || is_descendant(name, parent)
}

/// Every proper suffix of `name` on a label boundary, nearest first.
/// `a.b.example.com` yields `b.example.com`, `example.com`, `com`.
pub fn ancestors(name: &str) -> Vec<&str> {
    name.match_indices('.')
        .map(|(i, _)| &name[i + 1..])
        .filter(|s| !s.is_empty())
        .collect()
}

/// True if some name in `controlled` equals `name` or is its ancestor
pub fn is_covered<S: AsRef<str>>(name: &str, controlled: &[S]) -> bool {
    controlled
        .iter()
        .any(|c| is_same_or_descendant(name, c.as_ref()))
}

/// Trim, drop a trailing dot, lowercase and check label syntax.
/// A leading `*.` wildcard label is accepted.
pub fn normalize_fqdn(raw: &str) -> Result<String, DomainError> {
    let fqdn = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if fqdn.is_empty() {
        return Err(DomainError::InvalidInput("domain name is empty".into()));
    }
    if fqdn.len() > 253 {
        return Err(DomainError::InvalidInput(format!("{} is too long", fqdn)));
    }

    let body = fqdn.strip_prefix("*.").unwrap_or(&fqdn);
    for label in body.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(DomainError::InvalidInput(format!(
                "{} is not a valid domain name",
                raw.trim()
            )));
        }
    }

    Ok(fqdn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("foo.test.com", "test.com"));
        assert!(is_descendant("a.b.test.com", "test.com"));
        assert!(is_descendant("*.test.com", "test.com"));
    }

    #[test]
    fn test_equal_is_not_descendant() {
        assert!(!is_descendant("test.com", "test.com"));
        assert!(is_same_or_descendant("test.com", "test.com"));
    }

    #[test]
    fn test_label_boundary() {
        assert!(!is_descendant("notfoo.test.com", "foo.test.com"));
        assert!(!is_descendant("xtest.com", "test.com"));
        assert!(!is_descendant(".test.com", "test.com"));
        assert!(!is_descendant("test.com", ""));
    }

    #[test]
    fn test_case_sensitive() {
        assert!(!is_descendant("foo.TEST.com", "test.com"));
        assert!(!is_same_or_descendant("Test.com", "test.com"));
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("a.b.example.com"), vec!["b.example.com", "example.com", "com"]);
        assert!(ancestors("localhost").is_empty());
    }

    #[test]
    fn test_is_covered() {
        let controlled = vec!["example.com".to_string(), "other.org".to_string()];
        assert!(is_covered("example.com", &controlled));
        assert!(is_covered("www.example.com", &controlled));
        assert!(!is_covered("example.net", &controlled));
        assert!(!is_covered("com", &controlled));
    }

    #[test]
    fn test_normalize_fqdn() {
        assert_eq!(normalize_fqdn(" WWW.Example.com. ").unwrap(), "www.example.com");
        assert_eq!(normalize_fqdn("*.example.com").unwrap(), "*.example.com");
        assert_eq!(normalize_fqdn("_dmarc.example.com").unwrap(), "_dmarc.example.com");
        assert!(normalize_fqdn("").is_err());
        assert!(normalize_fqdn("a..b").is_err());
        assert!(normalize_fqdn("-bad.example.com").is_err());
        assert!(normalize_fqdn("www.*.example.com").is_err());
        assert!(normalize_fqdn("exa mple.com").is_err());
    }
}
