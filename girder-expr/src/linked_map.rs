//! Immutable linked map
//!
//! A persistent string-keyed map built as a chain of shadowing layers.
//! An update allocates one new layer over the existing map instead of
//! copying it; lookups consult the topmost layer first. Iteration
//! materializes a key-sorted item vector lazily, at most once per
//! instance.

use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Content of one layer: either an inline ordered table, or another
/// linked map shadowing `next` wholesale.
enum Layer<V> {
    Table(BTreeMap<String, V>),
    Chained(Arc<LinkedMap<V>>),
}

/// Persistent map with O(1) shadowing update and lazy sorted merge.
pub struct LinkedMap<V> {
    next: Option<Arc<LinkedMap<V>>>,
    layer: Layer<V>,
    items: OnceCell<Vec<(String, V)>>,
}

/// Error for [`LinkedMap::at`] on a missing key.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Missing key {key}")]
pub struct MissingKey {
    pub key: String,
}

impl<V: Clone> LinkedMap<V> {
    /// The empty map.
    pub fn empty() -> Arc<Self> {
        Self::from_map(BTreeMap::new())
    }

    /// A single-table map.
    pub fn from_map(map: BTreeMap<String, V>) -> Arc<Self> {
        Arc::new(Self {
            next: None,
            layer: Layer::Table(map),
            items: OnceCell::new(),
        })
    }

    /// A one-entry map.
    pub fn singleton(key: impl Into<String>, value: V) -> Arc<Self> {
        let mut map = BTreeMap::new();
        map.insert(key.into(), value);
        Self::from_map(map)
    }

    /// Shadow `next` with the entries of an inline table.
    pub fn shadow(next: Arc<Self>, map: BTreeMap<String, V>) -> Arc<Self> {
        Arc::new(Self {
            next: Some(next),
            layer: Layer::Table(map),
            items: OnceCell::new(),
        })
    }

    /// Shadow `next` with another linked map as a whole.
    pub fn link(next: Arc<Self>, content: Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            next: Some(next),
            layer: Layer::Chained(content),
            items: OnceCell::new(),
        })
    }

    /// Topmost binding for `key`, if any.
    pub fn find(&self, key: &str) -> Option<&V> {
        let own = match &self.layer {
            Layer::Table(map) => map.get(key),
            Layer::Chained(content) => content.find(key),
        };
        if own.is_some() {
            return own;
        }
        self.next.as_ref().and_then(|next| next.find(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Like [`LinkedMap::find`], but a missing key is an error.
    pub fn at(&self, key: &str) -> Result<&V, MissingKey> {
        self.find(key).ok_or_else(|| MissingKey {
            key: key.to_string(),
        })
    }

    /// True iff no layer holds any entry.
    pub fn is_empty(&self) -> bool {
        let own_empty = match &self.layer {
            Layer::Table(map) => map.is_empty(),
            Layer::Chained(content) => content.is_empty(),
        };
        own_empty && self.next.as_ref().map_or(true, |next| next.is_empty())
    }

    /// Key-sorted entries with shadowing applied; computed at most once.
    pub fn items(&self) -> &[(String, V)] {
        self.items.get_or_init(|| self.compute_sorted_items())
    }

    /// Number of distinct keys. Materializes the item vector.
    pub fn size(&self) -> usize {
        self.items().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.items().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.items().iter().map(|(_, v)| v.clone()).collect()
    }

    /// Merge this layer's sorted entries with `next`'s in lockstep; on a
    /// key collision this layer's entry wins.
    fn compute_sorted_items(&self) -> Vec<(String, V)> {
        let own: Vec<(String, V)> = match &self.layer {
            Layer::Table(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Layer::Chained(content) => content.items().to_vec(),
        };
        let Some(next) = &self.next else {
            return own;
        };
        let shadowed = next.items();
        let mut items = Vec::with_capacity(own.len() + shadowed.len());
        let mut mine = own.into_iter().peekable();
        let mut theirs = shadowed.iter().peekable();
        loop {
            match (mine.peek(), theirs.peek()) {
                (Some(m), Some(t)) => {
                    if m.0 == t.0 {
                        items.push(mine.next().expect("peeked"));
                        theirs.next();
                    } else if m.0 < t.0 {
                        items.push(mine.next().expect("peeked"));
                    } else {
                        items.push(theirs.next().expect("peeked").clone());
                    }
                }
                (Some(_), None) => items.push(mine.next().expect("peeked")),
                (None, Some(_)) => items.push(theirs.next().expect("peeked").clone()),
                (None, None) => break,
            }
        }
        items
    }
}

impl<V: Clone + PartialEq> LinkedMap<V> {
    /// Walk both sorted item sequences in lockstep; report the first key
    /// present in both with unequal values. Matching-valued duplicates
    /// are not conflicts.
    pub fn find_conflicting_duplicate(&self, other: &Self) -> Option<String> {
        let mut mine = self.items().iter().peekable();
        let mut theirs = other.items().iter().peekable();
        while let (Some(m), Some(t)) = (mine.peek(), theirs.peek()) {
            if m.0 == t.0 {
                if m.1 != t.1 {
                    return Some(m.0.clone());
                }
                mine.next();
                theirs.next();
            } else if m.0 < t.0 {
                mine.next();
            } else {
                theirs.next();
            }
        }
        None
    }
}

impl<V: Clone + PartialEq> PartialEq for LinkedMap<V> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
            || (self.is_empty() && other.is_empty())
            || self.items() == other.items()
    }
}

impl<V: Clone + PartialEq> Eq for LinkedMap<V> {}

impl<V: Clone + std::fmt::Debug> std::fmt::Debug for LinkedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.items().iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, i64)]) -> BTreeMap<String, i64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_find_shadows() {
        let base = LinkedMap::from_map(table(&[("a", 1), ("b", 2)]));
        let updated = LinkedMap::shadow(base.clone(), table(&[("b", 3)]));
        assert_eq!(updated.find("b"), Some(&3));
        assert_eq!(updated.find("a"), Some(&1));
        assert_eq!(base.find("b"), Some(&2));
        assert_eq!(updated.find("c"), None);
    }

    #[test]
    fn test_at_missing_key() {
        let map = LinkedMap::from_map(table(&[("a", 1)]));
        assert_eq!(map.at("a"), Ok(&1));
        assert_eq!(
            map.at("z"),
            Err(MissingKey {
                key: "z".to_string()
            })
        );
    }

    #[test]
    fn test_items_sorted_and_deduplicated() {
        let base = LinkedMap::from_map(table(&[("c", 1), ("a", 2)]));
        let map = LinkedMap::shadow(base, table(&[("b", 3), ("c", 4)]));
        assert_eq!(
            map.items(),
            &[
                ("a".to_string(), 2),
                ("b".to_string(), 3),
                ("c".to_string(), 4)
            ]
        );
        assert_eq!(map.size(), 3);
        assert_eq!(map.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_chained_content_layer() {
        let base = LinkedMap::from_map(table(&[("a", 1), ("b", 2)]));
        let overlay = LinkedMap::from_map(table(&[("b", 9), ("z", 8)]));
        let map = LinkedMap::link(base, overlay);
        assert_eq!(map.find("b"), Some(&9));
        assert_eq!(map.find("a"), Some(&1));
        assert_eq!(map.size(), 3);
    }

    #[test]
    fn test_equality_ignores_construction() {
        let flat = LinkedMap::from_map(table(&[("a", 1), ("b", 2)]));
        let layered =
            LinkedMap::shadow(LinkedMap::from_map(table(&[("a", 1)])), table(&[("b", 2)]));
        assert_eq!(*flat, *layered);
        let empty_a: Arc<LinkedMap<i64>> = LinkedMap::empty();
        let empty_b = LinkedMap::shadow(LinkedMap::empty(), BTreeMap::new());
        assert_eq!(*empty_a, *empty_b);
    }

    #[test]
    fn test_conflicting_duplicate() {
        let left = LinkedMap::from_map(table(&[("a", 1), ("b", 2)]));
        let right_match = LinkedMap::from_map(table(&[("b", 2), ("c", 3)]));
        assert_eq!(left.find_conflicting_duplicate(&right_match), None);
        let right_conflict = LinkedMap::from_map(table(&[("b", 7)]));
        assert_eq!(
            left.find_conflicting_duplicate(&right_conflict),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_empty() {
        let empty: Arc<LinkedMap<i64>> = LinkedMap::empty();
        assert!(empty.is_empty());
        let shadowed = LinkedMap::shadow(LinkedMap::empty(), table(&[("a", 1)]));
        assert!(!shadowed.is_empty());
    }
}
