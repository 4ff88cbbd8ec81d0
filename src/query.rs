use regex::Regex;
use std::sync::LazyLock;

/// Longest domain name accepted, not counting a trailing root dot.
pub const MAX_QUERY_LEN: usize = 253;

static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}\.?$")
        .expect("domain pattern is valid")
});

/// Checks a WHOIS query line (terminators already stripped) against the
/// domain-name grammar: one or more dot-separated labels of letters, digits
/// and inner hyphens (at most 63 characters each), then an alphabetic TLD of
/// 2 to 63 letters, with an optional trailing dot.
#[must_use]
pub fn is_valid_query(query: &str) -> bool {
    let name = query.strip_suffix('.').unwrap_or(query);
    name.len() <= MAX_QUERY_LEN && DOMAIN_PATTERN.is_match(query)
}
