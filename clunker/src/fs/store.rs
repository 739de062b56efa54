use std::collections::BTreeMap;
use std::ops::Bound;

use super::node::NodeHandle;

/// Ordered map from absolute path to shared file object. Keys are kept
/// lexicographically sorted so directory listings and subtree queries are
/// single range scans.
#[derive(Debug, Default)]
pub struct ObjectStore {
    map: BTreeMap<String, NodeHandle>,
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, path: &str) -> Option<NodeHandle> {
        self.map.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.map.contains_key(path)
    }

    pub fn insert(&mut self, path: String, node: NodeHandle) {
        self.map.insert(path, node);
    }

    pub fn erase(&mut self, path: &str) -> Option<NodeHandle> {
        self.map.remove(path)
    }

    /// Immediate children of `dir`: a lower-bound seek at the child prefix,
    /// walking while keys carry the prefix. A name containing a further `/`
    /// would be a grandchild whose parent was never materialized; those are
    /// skipped.
    pub fn children<'a>(
        &'a self,
        dir: &str,
    ) -> impl Iterator<Item = (&'a str, &'a NodeHandle)> + 'a {
        let prefix = child_prefix(dir);
        let skip = prefix.len();
        self.map
            .range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter_map(move |(key, node)| {
                let name = &key[skip..];
                if name.is_empty() || name.contains('/') {
                    None
                } else {
                    Some((name, node))
                }
            })
    }

    /// True if any key lies strictly under `dir` (the `rmdir` emptiness
    /// check).
    pub fn has_descendants(&self, dir: &str) -> bool {
        let prefix = child_prefix(dir);
        self.map
            .range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    /// All entries in reverse key order: descendants strictly precede their
    /// ancestors, which is the removal order `clean` wants.
    pub fn iter_rev(&self) -> impl Iterator<Item = (&str, &NodeHandle)> + '_ {
        self.map.iter().rev().map(|(k, v)| (k.as_str(), v))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::node::FileNode;

    fn dir(id: u64) -> NodeHandle {
        FileNode::new_directory(id, 0o755, 0, 0)
    }

    fn file(id: u64) -> NodeHandle {
        FileNode::new_regular(id, 0o644, 0, 0)
    }

    fn seeded() -> ObjectStore {
        let mut store = ObjectStore::new();
        store.insert("/".to_string(), dir(1));
        store.insert("/a".to_string(), dir(2));
        store.insert("/a/x".to_string(), file(3));
        store.insert("/a/y".to_string(), file(4));
        store.insert("/a/y/z".to_string(), file(5));
        store.insert("/b".to_string(), file(6));
        store
    }

    #[test]
    fn test_children_of_root() {
        let store = seeded();
        let names: Vec<&str> = store.children("/").map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_children_skip_grandchildren() {
        let store = seeded();
        let names: Vec<&str> = store.children("/a").map(|(name, _)| name).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_children_ignore_adjacent_keys() {
        // '!' sorts below '/', so "/a!side" sits between "/a" and "/a/..".
        let mut store = seeded();
        store.insert("/a!side".to_string(), file(7));
        let names: Vec<&str> = store.children("/a").map(|(name, _)| name).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_has_descendants() {
        let store = seeded();
        assert!(store.has_descendants("/a"));
        assert!(store.has_descendants("/a/y"));
        assert!(!store.has_descendants("/b"));
        assert!(!store.has_descendants("/missing"));
    }

    #[test]
    fn test_reverse_order_lists_descendants_first() {
        let store = seeded();
        let keys: Vec<&str> = store.iter_rev().map(|(key, _)| key).collect();
        let a = keys.iter().position(|&k| k == "/a").unwrap();
        let ax = keys.iter().position(|&k| k == "/a/x").unwrap();
        let ayz = keys.iter().position(|&k| k == "/a/y/z").unwrap();
        assert!(ax < a);
        assert!(ayz < a);
        assert_eq!(*keys.last().unwrap(), "/");
    }
}
