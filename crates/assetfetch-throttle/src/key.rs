use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

/// Canonical `host[:port]` identifying the remote endpoint a request goes to.
///
/// Two locators map to the same key iff an HTTP client would open connections
/// to the same authority: the host is lowercased, scheme, userinfo and path are
/// dropped, and a default port is stripped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DestinationKey(String);

impl DestinationKey {
    pub fn from_locator(locator: &str) -> Self {
        Self(canonical_destination(locator))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DestinationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DestinationKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Extract the lowercase `host[:port]` of a locator.
///
/// Accepts `scheme://[userinfo@]host[:port][/path]` as well as the bare
/// `[userinfo@]host[:port][/path]` form. `:80` is always stripped, `:443` only
/// for `https`.
pub fn canonical_destination(locator: &str) -> String {
    let mut rest = locator.trim();
    let mut https = false;
    if let Some(idx) = rest.find("://") {
        let scheme = &rest[..idx];
        if is_scheme(scheme) {
            https = scheme.eq_ignore_ascii_case("https");
            rest = &rest[idx + 3..];
        }
    }

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let mut authority = &rest[..end];
    if let Some(at) = authority.find('@') {
        authority = &authority[at + 1..];
    }

    let (host, port) = split_port(authority);
    let mut key = host.to_ascii_lowercase();
    match port {
        Some("80") | None => {}
        Some("443") if https => {}
        Some(port) => {
            key.push(':');
            key.push_str(port);
        }
    }
    key
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

// The port colon is the first ':' followed by a digit; bracketed IPv6 literals
// keep their inner colons.
fn split_port(authority: &str) -> (&str, Option<&str>) {
    let search_from = if authority.starts_with('[') {
        match authority.find(']') {
            Some(close) => close + 1,
            None => return (authority, None),
        }
    } else {
        0
    };
    let bytes = authority.as_bytes();
    let colon = (search_from..bytes.len())
        .find(|&i| bytes[i] == b':' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit));
    match colon {
        Some(i) => {
            let digits = &authority[i + 1..];
            let len = digits
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count();
            (&authority[..i], Some(&digits[..len]))
        }
        None => (authority.trim_end_matches(':'), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_userinfo_path_and_default_port() {
        assert_eq!(
            canonical_destination("HTTP://User:pw@X.Example.COM:80/path?q=1"),
            "x.example.com"
        );
        assert_eq!(
            canonical_destination("http://x.example.com/textures/abc"),
            "x.example.com"
        );
    }

    #[test]
    fn keeps_non_default_ports() {
        assert_eq!(
            canonical_destination("http://cdn.example.com:12046/"),
            "cdn.example.com:12046"
        );
        assert_eq!(
            canonical_destination("https://cdn.example.com:443/a"),
            "cdn.example.com"
        );
        assert_eq!(
            canonical_destination("http://cdn.example.com:443/a"),
            "cdn.example.com:443"
        );
    }

    #[test]
    fn accepts_bare_authority() {
        assert_eq!(canonical_destination("Sim.Example.com:8080/cap"), "sim.example.com:8080");
        assert_eq!(canonical_destination("bob@sim.example.com:80"), "sim.example.com");
        assert_eq!(canonical_destination("sim.example.com:"), "sim.example.com");
    }

    #[test]
    fn ipv6_literal() {
        assert_eq!(canonical_destination("http://[::1]:9000/x"), "[::1]:9000");
        assert_eq!(canonical_destination("http://[::1]/x"), "[::1]");
    }

    #[test]
    fn equal_keys_for_equivalent_locators() {
        let a = DestinationKey::from_locator("http://A.example.com:80/one");
        let b = DestinationKey::from_locator("a.example.com/two");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "a.example.com");
    }
}
