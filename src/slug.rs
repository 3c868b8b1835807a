//! Slug validation (spec §3, §4.2, §8).
//!
//! A slug is `[a-z0-9-]{3,20}`, no leading/trailing `-`, not a member of the
//! forbidden list. `ping` is reserved twice over: once here as a forbidden
//! registration name, and again by the HTTP router (spec §4.6 step 4) as a
//! health endpoint that must never reach the registry.

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 20;

/// Reserved names. The source checks this list before the length/charset
/// rules (spec §9 open question — preserved here).
const FORBIDDEN: &[&str] = &[
    "ping", "admin", "api", "www", "root", "localhost", "tunnl", "status", "health",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlugVerdict {
    Valid,
    Invalid,
    Forbidden,
}

/// Classify a slug per spec §3/§8. Forbidden-set membership is checked first,
/// even for a slug that is also too short/long — matching the source's
/// documented order.
pub fn classify(slug: &str) -> SlugVerdict {
    if FORBIDDEN.contains(&slug) {
        return SlugVerdict::Forbidden;
    }
    if !is_well_formed(slug) {
        return SlugVerdict::Invalid;
    }
    SlugVerdict::Valid
}

fn is_well_formed(slug: &str) -> bool {
    let len = slug.chars().count();
    if !(MIN_LEN..=MAX_LEN).contains(&len) {
        return false;
    }
    if !slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return false;
    }
    true
}

/// Whether the literal `ping` health-check name — checked by the HTTP router
/// before any registry lookup (spec §4.6 step 4).
pub fn is_health_slug(slug: &str) -> bool {
    slug == "ping"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_boundaries() {
        assert_eq!(classify("ab"), SlugVerdict::Invalid);
        assert_eq!(classify("abc"), SlugVerdict::Valid);
        assert_eq!(classify(&"a".repeat(20)), SlugVerdict::Valid);
        assert_eq!(classify(&"a".repeat(21)), SlugVerdict::Invalid);
    }

    #[test]
    fn leading_trailing_dash() {
        assert_eq!(classify("-foo"), SlugVerdict::Invalid);
        assert_eq!(classify("foo-"), SlugVerdict::Invalid);
        assert_eq!(classify("foo-bar"), SlugVerdict::Valid);
    }

    #[test]
    fn forbidden_wins_over_malformed_length() {
        // "ping" is 4 chars, well within bounds, but still must report Forbidden.
        assert_eq!(classify("ping"), SlugVerdict::Forbidden);
        assert_eq!(classify("admin"), SlugVerdict::Forbidden);
    }

    #[test]
    fn health_slug_bypasses_registry() {
        assert!(is_health_slug("ping"));
        assert!(!is_health_slug("pingpong"));
    }

    #[test]
    fn rejects_uppercase_and_symbols() {
        assert_eq!(classify("Foo-Bar"), SlugVerdict::Invalid);
        assert_eq!(classify("foo_bar"), SlugVerdict::Invalid);
        assert_eq!(classify("foo.bar"), SlugVerdict::Invalid);
    }
}
