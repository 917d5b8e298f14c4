//! Path blocklist matching and route display-name rewriting.
//!
//! Both helpers accept either a regular expression or a plain path
//! fragment: patterns are compiled as regular expressions first, and a
//! pattern that fails to compile is demoted to a literal substring
//! matcher. Operators can therefore configure `"^/api/"` and
//! `"/health_:)"` alike without escaping anything.

use regex::Regex;

enum Matcher {
    Pattern(Regex),
    Literal(String),
}

impl Matcher {
    fn compile(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Matcher::Pattern(re),
            Err(_) => Matcher::Literal(pattern.to_owned()),
        }
    }
}

/// Decides whether a request path is excluded from tracing.
///
/// Without a pattern the filter rejects nothing.
pub struct PathFilter(Option<Matcher>);

impl PathFilter {
    pub fn new(pattern: Option<&str>) -> Self {
        PathFilter(
            pattern
                .filter(|pattern| !pattern.is_empty())
                .map(Matcher::compile),
        )
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.0 {
            None => false,
            Some(Matcher::Pattern(re)) => re.is_match(path),
            Some(Matcher::Literal(fragment)) => path.contains(fragment.as_str()),
        }
    }
}

/// Rewrites the route display name used for span names and the
/// `http.route` attribute, e.g. collapsing locale prefixes.
///
/// The rule is a `[matcher, replacement]` pair. An absent or malformed
/// rule (anything but exactly two elements) is the identity.
pub struct PathRewriter(Option<(Matcher, String)>);

impl PathRewriter {
    pub fn new(rule: Option<&[String]>) -> Self {
        PathRewriter(match rule {
            Some([matcher, replacement]) => {
                Some((Matcher::compile(matcher), replacement.clone()))
            }
            _ => None,
        })
    }

    pub fn rewrite(&self, path: &str) -> String {
        match &self.0 {
            None => path.to_owned(),
            Some((Matcher::Pattern(re), replacement)) => {
                re.replace(path, replacement.as_str()).into_owned()
            }
            Some((Matcher::Literal(fragment), replacement)) => {
                path.replacen(fragment.as_str(), replacement, 1)
            }
        }
    }
}
