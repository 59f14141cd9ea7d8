//! URL pattern matching.
//!
//! The router never matches paths itself; it hands patterns to a
//! [`Matcher`] and asks it for lookups. [`RadixMatcher`] is the default: one
//! [`matchit`] radix tree per method, O(path-length) lookup.
//!
//! Patterns are normalized before they reach the matcher:
//!
//! | Declared | Inserted |
//! |---|---|
//! | `/users/:id` | `/users/{id}` |
//! | `/files/*` | `/files/{*wildcard}` |
//! | `/users/` | `/users` |
//! | `/` | `/` |

use std::collections::HashMap;

use matchit::Router as MatchitRouter;

use crate::error::BoxError;
use crate::method::Method;

/// A successful lookup: the stored value and the raw (still percent-encoded)
/// parameters in declaration order.
#[derive(Debug)]
pub struct Matched<'a, T> {
    pub value: &'a T,
    pub params: Vec<(String, String)>,
}

/// Pattern-matching backend of a [`Router`](crate::Router).
///
/// A matcher is only ever mutated while it is private to the router: every
/// change fills an empty one and publishes it whole, so implementations need
/// no interior locking.
pub trait Matcher<T>: Send + Sync + 'static {
    /// Inserts an already-normalized pattern.
    fn insert(&mut self, method: Method, pattern: &str, value: T) -> Result<(), BoxError>;

    /// Looks up an already-normalized path.
    fn at(&self, method: Method, path: &str) -> Option<Matched<'_, T>>;

    /// Removes every route.
    fn reset(&mut self);
}

/// [`matchit`]-backed matcher.
pub struct RadixMatcher<T> {
    trees: HashMap<Method, MatchitRouter<T>>,
}

impl<T> Default for RadixMatcher<T> {
    fn default() -> Self {
        Self { trees: HashMap::new() }
    }
}

impl<T: Send + Sync + 'static> Matcher<T> for RadixMatcher<T> {
    fn insert(&mut self, method: Method, pattern: &str, value: T) -> Result<(), BoxError> {
        self.trees.entry(method).or_default().insert(pattern, value)?;
        Ok(())
    }

    fn at(&self, method: Method, path: &str) -> Option<Matched<'_, T>> {
        let matched = self.trees.get(&method)?.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some(Matched { value: matched.value, params })
    }

    fn reset(&mut self) {
        self.trees.clear();
    }
}

/// Strips a trailing slash, keeping the root as `/`.
pub(crate) fn normalize_path(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some("") | None => path,
        Some(stripped) => stripped,
    }
}

/// Rewrites `:name` and bare `*` segments into matchit syntax and strips a
/// trailing slash.
pub(crate) fn normalize_pattern(pattern: &str) -> String {
    let pattern = normalize_path(pattern);
    if pattern == "/" {
        return pattern.to_owned();
    }
    pattern
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if segment == "*" {
                "{*wildcard}".to_owned()
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_patterns() {
        assert_eq!(normalize_pattern("/users/:id"), "/users/{id}");
        assert_eq!(normalize_pattern("/users/{id}/"), "/users/{id}");
        assert_eq!(normalize_pattern("/files/*"), "/files/{*wildcard}");
        assert_eq!(normalize_pattern("/"), "/");
        assert_eq!(normalize_path("/a/"), normalize_path("/a"));
    }

    #[test]
    fn matches_per_method() {
        let mut m = RadixMatcher::default();
        m.insert(Method::Get, "/users/{id}", 1).unwrap();
        m.insert(Method::Post, "/users", 2).unwrap();

        let hit = m.at(Method::Get, "/users/42").unwrap();
        assert_eq!(*hit.value, 1);
        assert_eq!(hit.params, vec![("id".to_owned(), "42".to_owned())]);
        assert!(m.at(Method::Post, "/users/42").is_none());
        assert!(m.at(Method::Delete, "/users").is_none());
    }

    #[test]
    fn duplicate_pattern_conflicts_until_reset() {
        let mut m = RadixMatcher::default();
        m.insert(Method::Get, "/a", ()).unwrap();
        assert!(m.insert(Method::Get, "/a", ()).is_err());

        m.reset();
        assert!(m.at(Method::Get, "/a").is_none());
        m.insert(Method::Get, "/a", ()).unwrap();
    }
}
