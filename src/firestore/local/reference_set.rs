use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Pairs of `(document, id)` where the id is a target id or a batch id.
///
/// Both orderings are indexed so callers can ask "who references this
/// document" and "what does this id reference" cheaply.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys released.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let released = self.references_for_id(id);
        for key in &released {
            self.remove_reference(key, id);
        }
        released
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        let released = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        released
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(candidate, _)| *candidate == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("c/a"), 1);
        refs.add_reference(key("c/a"), 2);
        refs.add_reference(key("c/b"), 2);

        assert!(refs.contains_key(&key("c/a")));
        assert_eq!(
            refs.references_for_id(2),
            [key("c/a"), key("c/b")].into_iter().collect()
        );

        let released = refs.remove_references_for_id(2);
        assert_eq!(released.len(), 2);
        assert!(refs.contains_key(&key("c/a")));
        assert!(!refs.contains_key(&key("c/b")));

        refs.remove_reference(&key("c/a"), 1);
        assert!(refs.is_empty());
    }

    #[test]
    fn remove_all_returns_every_key() {
        let mut refs = ReferenceSet::new();
        refs.add_references(&[key("c/a"), key("c/b")], 3);
        let released = refs.remove_all_references();
        assert_eq!(released.len(), 2);
        assert!(refs.is_empty());
    }
}
