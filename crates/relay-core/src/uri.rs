//! The URI value type used for channel patterns, resources, and recipients.
//!
//! A [`Uri`] decomposes `scheme://host:port/seg1/seg2?k=v#frag` into its
//! parts so the prefix map and the dispatcher can reason about it segment by
//! segment instead of re-parsing strings on every match. Scheme, host:port,
//! and individual path segments are case-folded to lower case on parse;
//! query and fragment are left as-is.

use std::fmt;

use crate::error::Error;

/// A single `key=value` query parameter, order preserved.
pub type QueryParam = (String, String);

/// A decomposed, comparison-ready URI.
///
/// Any component (scheme, host:port, or a single path segment) may be the
/// literal string `*`, which is a wildcard when this `Uri` is used as a
/// subscription channel or resource *pattern*. A pattern whose last segment
/// is `*` additionally matches any number of trailing segments ("descendant
/// wildcard"); a `*` anywhere else matches exactly one segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: String,
    hostport: String,
    segments: Vec<String>,
    query: Vec<QueryParam>,
    fragment: Option<String>,
}

impl Uri {
    /// Scheme, lower-cased (`"http"`, `"pubsub"`, `"*"`, ...).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Authority component, lower-cased.
    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    /// Path segments, lower-cased, in order, with no leading/trailing slash.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Query parameters in the order they appeared.
    pub fn query(&self) -> &[QueryParam] {
        &self.query
    }

    /// Returns the first value bound to `key`, if present.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Fragment, if any (never includes the leading `#`).
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// True if every component is the literal wildcard segment.
    pub fn is_wildcard_segment(segment: &str) -> bool {
        segment == "*"
    }

    /// Builds a `Uri` directly from already-normalized parts. Used by the
    /// prefix map and registry when constructing synthetic keys (e.g. the
    /// reserved `pubsub://<self>/changes` channel) without going through the
    /// string parser.
    pub fn from_parts(
        scheme: impl Into<String>,
        hostport: impl Into<String>,
        segments: Vec<String>,
    ) -> Self {
        Uri {
            scheme: scheme.into().to_ascii_lowercase(),
            hostport: hostport.into().to_ascii_lowercase(),
            segments: segments
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            query: Vec::new(),
            fragment: None,
        }
    }

    /// The `[scheme, hostport, seg1, .., segN]` path used as a trie key.
    pub(crate) fn trie_path(&self) -> Vec<&str> {
        let mut path = Vec::with_capacity(self.segments.len() + 2);
        path.push(self.scheme.as_str());
        path.push(self.hostport.as_str());
        path.extend(self.segments.iter().map(String::as_str));
        path
    }

    /// Number of components shared with `other`, counting from the scheme,
    /// stopping at the first mismatch. This is the literal, non-wildcard
    /// similarity used for `BestParent` and the max-similarity invariant: a
    /// `Uri` is always at least as similar to itself as to any other `Uri`.
    pub fn similarity(&self, other: &Uri) -> usize {
        let mut score = 0;
        if self.scheme != other.scheme {
            return score;
        }
        score += 1;
        if self.hostport != other.hostport {
            return score;
        }
        score += 1;
        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            if a != b {
                break;
            }
            score += 1;
        }
        score
    }

    /// Upper bound on [`Uri::similarity`] against any other `Uri`: scheme,
    /// host:port, and every path segment.
    pub fn max_similarity(&self) -> usize {
        self.segments.len() + 2
    }

    /// True if `self`, used as a subscription pattern, matches `event`.
    ///
    /// `*` matches any single component in scheme, host:port, or a
    /// non-trailing segment. A trailing `*` segment matches any number of
    /// remaining segments in `event` (including zero).
    pub fn matches_pattern(&self, event: &Uri) -> bool {
        if !component_matches(&self.scheme, &event.scheme) {
            return false;
        }
        if !component_matches(&self.hostport, &event.hostport) {
            return false;
        }
        segments_match(&self.segments, &event.segments)
    }

    /// The longest prefix of `self` that contains no wildcard component,
    /// i.e. the portion of a pattern that can be used as a concrete trie
    /// key. Used by the dispatcher to index subscriptions by their static
    /// prefix rather than re-scanning every subscription on every dispatch.
    pub(crate) fn static_prefix(&self) -> Vec<String> {
        let mut prefix = Vec::new();
        if self.scheme == "*" {
            return prefix;
        }
        prefix.push(self.scheme.clone());
        if self.hostport == "*" {
            return prefix;
        }
        prefix.push(self.hostport.clone());
        for seg in &self.segments {
            if seg == "*" {
                break;
            }
            prefix.push(seg.clone());
        }
        prefix
    }
}

fn component_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

fn segments_match(pattern: &[String], event: &[String]) -> bool {
    let mut pi = pattern.iter();
    let mut ei = event.iter();
    loop {
        match (pi.next(), ei.next()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(p), rest) if p == "*" && pi.as_slice().is_empty() => {
                // Trailing wildcard: matches the rest of `event`, including
                // the element we just consumed from `ei` (if any).
                let _ = rest;
                return true;
            }
            (Some(_), None) => return false,
            (Some(p), Some(e)) => {
                if !component_matches(p, e) {
                    return false;
                }
            }
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.hostport)?;
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        if !self.query.is_empty() {
            f.write_str("?")?;
            for (i, (k, v)) in self.query.iter().enumerate() {
                if i > 0 {
                    f.write_str("&")?;
                }
                write!(f, "{k}={v}")?;
            }
        }
        if let Some(frag) = &self.fragment {
            write!(f, "#{frag}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Uri {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::BadRequest(format!("uri missing scheme separator: {input}")))?;
        if scheme.is_empty() {
            return Err(Error::BadRequest(format!("uri missing scheme: {input}")));
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((r, f)) => (r, Some(f.to_string())),
            None => (rest, None),
        };
        let (rest, query_str) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };

        let mut parts = rest.splitn(2, '/');
        let hostport = parts.next().unwrap_or_default();
        if hostport.is_empty() {
            return Err(Error::BadRequest(format!("uri missing host:port: {input}")));
        }
        let path = parts.next().unwrap_or_default();
        let segments = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/')
                .map(|s| s.to_ascii_lowercase())
                .collect::<Vec<_>>()
        };

        let query = query_str
            .map(|q| {
                q.split('&')
                    .filter(|p| !p.is_empty())
                    .map(|p| match p.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (p.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Uri {
            scheme: scheme.to_ascii_lowercase(),
            hostport: hostport.to_ascii_lowercase(),
            segments,
            query,
            fragment,
        })
    }
}

impl serde::Serialize for Uri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Uri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn parses_scheme_host_path_query_fragment() {
        let u = uri("http://example.com:8080/a/B/c?x=1&y=2#frag");
        assert_eq!(u.scheme(), "http");
        assert_eq!(u.hostport(), "example.com:8080");
        assert_eq!(u.segments(), &["a", "b", "c"]);
        assert_eq!(u.query_param("x"), Some("1"));
        assert_eq!(u.fragment(), Some("frag"));
    }

    #[test]
    fn similarity_stops_at_first_mismatch() {
        let a = uri("http://h/a/b/c");
        let b = uri("http://h/a/x/c");
        assert_eq!(a.similarity(&b), 3); // scheme + host + "a"
        assert_eq!(a.similarity(&a), a.max_similarity());
    }

    #[test]
    fn similarity_is_maximal_against_self() {
        let a = uri("http://h/a/b/c");
        for other in ["http://h/a/b", "http://other/a/b/c", "ftp://h/a/b/c"] {
            assert!(a.similarity(&a) >= a.similarity(&uri(other)));
        }
    }

    #[test]
    fn wildcard_segment_matches_exactly_one() {
        let pattern = uri("http://h/a/*/c");
        assert!(pattern.matches_pattern(&uri("http://h/a/x/c")));
        assert!(!pattern.matches_pattern(&uri("http://h/a/x/y/c")));
        assert!(!pattern.matches_pattern(&uri("http://h/a/c")));
    }

    #[test]
    fn trailing_wildcard_matches_any_descendant() {
        let pattern = uri("http://h/a/*");
        assert!(pattern.matches_pattern(&uri("http://h/a")));
        assert!(pattern.matches_pattern(&uri("http://h/a/b")));
        assert!(pattern.matches_pattern(&uri("http://h/a/b/c")));
        assert!(!pattern.matches_pattern(&uri("http://h/x")));
    }

    #[test]
    fn scheme_and_host_wildcards() {
        let pattern = uri("pubsub://*/changes");
        assert!(pattern.matches_pattern(&uri("pubsub://relay-1/changes")));
        assert!(!pattern.matches_pattern(&uri("pubsub://relay-1/other")));
    }

    #[test]
    fn static_prefix_stops_at_first_wildcard() {
        assert_eq!(
            uri("http://h/a/*/c").static_prefix(),
            vec!["http", "h", "a"]
        );
        assert_eq!(uri("http://*/a").static_prefix(), vec!["http"]);
        assert_eq!(uri("*://h/a").static_prefix(), Vec::<String>::new());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let u = uri("http://h/a/b?x=1#f");
        let rendered = u.to_string();
        let reparsed = uri(&rendered);
        assert_eq!(u, reparsed);
    }
}
