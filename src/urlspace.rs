//! URL-specific data
//!
//! A registry mapping `(server, method, url-pattern)` to a value, used to
//! route requests to worker pools. Patterns are paths; a trailing `/*` makes
//! the entry apply to the whole subtree. Lookup returns the value of the
//! longest matching pattern: an exact entry on the full path first, otherwise
//! the deepest subtree entry passed on the way down.

use std::collections::HashMap;

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    /// Value registered on exactly this path
    exact: Option<T>,
    /// Value registered on this path with a `/*` tail
    subtree: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Node {
            children: HashMap::new(),
            exact: None,
            subtree: None,
        }
    }
}

/// Trie of URL-specific values.
#[derive(Debug)]
pub struct UrlSpace<T> {
    roots: HashMap<(String, String), Node<T>>,
}

impl<T> Default for UrlSpace<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(url: &str) -> impl Iterator<Item = &str> {
    url.split('/').filter(|s| !s.is_empty())
}

impl<T> UrlSpace<T> {
    pub fn new() -> Self {
        UrlSpace {
            roots: HashMap::new(),
        }
    }

    /// Register `value` under `(server, method, pattern)`. A later
    /// registration on the same pattern replaces the earlier one.
    pub fn register(&mut self, server: &str, method: &str, pattern: &str, value: T) {
        let (path, wildcard) = match pattern.strip_suffix("/*") {
            Some(path) => (if path.is_empty() { "/" } else { path }, true),
            None => (pattern, false),
        };
        let mut node = self
            .roots
            .entry((server.to_string(), method.to_string()))
            .or_insert_with(Node::new);
        for segment in segments(path) {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(Node::new);
        }
        if wildcard {
            node.subtree = Some(value);
        } else {
            node.exact = Some(value);
        }
    }

    /// Longest-pattern match for `(server, method, url)`.
    pub fn lookup(&self, server: &str, method: &str, url: &str) -> Option<&T> {
        let root = self
            .roots
            .get(&(server.to_string(), method.to_string()))?;
        let mut node = root;
        let mut best_subtree = root.subtree.as_ref();
        for segment in segments(url) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.subtree.is_some() {
                        best_subtree = node.subtree.as_ref();
                    }
                }
                None => return best_subtree,
            }
        }
        node.exact.as_ref().or(best_subtree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> UrlSpace<&'static str> {
        let mut space = UrlSpace::new();
        space.register("web", "GET", "/*", "root");
        space.register("web", "GET", "/api/*", "api");
        space.register("web", "GET", "/api/v2/*", "api-v2");
        space.register("web", "GET", "/health", "health");
        space
    }

    #[test]
    fn test_exact_beats_subtree() {
        let space = space();
        assert_eq!(space.lookup("web", "GET", "/health"), Some(&"health"));
    }

    #[test]
    fn test_longest_subtree_wins() {
        let space = space();
        assert_eq!(space.lookup("web", "GET", "/api/users"), Some(&"api"));
        assert_eq!(space.lookup("web", "GET", "/api/v2/users"), Some(&"api-v2"));
        assert_eq!(space.lookup("web", "GET", "/other"), Some(&"root"));
    }

    #[test]
    fn test_method_and_server_are_keys() {
        let space = space();
        assert_eq!(space.lookup("web", "POST", "/api/users"), None);
        assert_eq!(space.lookup("other", "GET", "/api/users"), None);
    }

    #[test]
    fn test_no_match_without_root_wildcard() {
        let mut space = UrlSpace::new();
        space.register("web", "GET", "/only/here", 1u32);
        assert_eq!(space.lookup("web", "GET", "/elsewhere"), None);
        assert_eq!(space.lookup("web", "GET", "/only"), None);
        assert_eq!(space.lookup("web", "GET", "/only/here"), Some(&1));
        // deeper than an exact entry does not match it
        assert_eq!(space.lookup("web", "GET", "/only/here/deeper"), None);
    }

    #[test]
    fn test_replace_registration() {
        let mut space = UrlSpace::new();
        space.register("web", "GET", "/x", 1u32);
        space.register("web", "GET", "/x", 2u32);
        assert_eq!(space.lookup("web", "GET", "/x"), Some(&2));
    }
}
