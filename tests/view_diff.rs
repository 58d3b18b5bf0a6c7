use std::collections::{BTreeMap, BTreeSet};

use firestore_sync::firestore::core::{ChangeType, Direction, OrderBy, Query, View, ViewSnapshot};
use firestore_sync::firestore::local::DocumentMap;
use firestore_sync::firestore::model::{
    DocumentKey, FieldPath, MutableDocument, ResourcePath, SnapshotVersion, Timestamp,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};

fn doc(path: &str, seconds: i64, score: i64) -> MutableDocument {
    let mut fields = BTreeMap::new();
    fields.insert("score".to_string(), FirestoreValue::from_integer(score));
    let version = SnapshotVersion::new(Timestamp::new(seconds, 0));
    MutableDocument::new_found_document(
        DocumentKey::from_string(path).unwrap(),
        version,
        version,
        MapValue::new(fields),
    )
}

fn deleted(path: &str, seconds: i64) -> MutableDocument {
    MutableDocument::new_no_document(
        DocumentKey::from_string(path).unwrap(),
        SnapshotVersion::new(Timestamp::new(seconds, 0)),
    )
}

fn as_map(documents: Vec<MutableDocument>) -> DocumentMap {
    documents
        .into_iter()
        .map(|document| (document.key().clone(), document))
        .collect()
}

fn apply(view: &mut View, changes: &DocumentMap) -> ViewSnapshot {
    let doc_changes = view.compute_doc_changes(changes, None).unwrap();
    view.apply_changes(doc_changes, false, None, false)
        .snapshot
        .expect("changes raise a snapshot")
}

/// Replays `snapshot.doc_changes` onto `before` and returns the result.
fn replay(before: &BTreeMap<DocumentKey, MapValue>, snapshot: &ViewSnapshot) -> BTreeMap<DocumentKey, MapValue> {
    let mut after = before.clone();
    for change in &snapshot.doc_changes {
        let key = change.document.key().clone();
        match change.change_type {
            ChangeType::Added => {
                assert!(after.insert(key, change.document.data().clone()).is_none());
            }
            ChangeType::Removed => {
                assert!(after.remove(&key).is_some());
            }
            ChangeType::Modified | ChangeType::Metadata => {
                assert!(after.insert(key, change.document.data().clone()).is_some());
            }
        }
    }
    after
}

fn contents(snapshot: &ViewSnapshot) -> BTreeMap<DocumentKey, MapValue> {
    snapshot
        .docs
        .iter()
        .map(|document| (document.key().clone(), document.data().clone()))
        .collect()
}

#[test]
fn replaying_changes_reconstructs_the_new_result_set() {
    let query = Query::new(ResourcePath::from_string("games").unwrap()).with_order_by(OrderBy::new(
        FieldPath::from_dot_separated("score").unwrap(),
        Direction::Ascending,
    ));
    let mut view = View::new(query, BTreeSet::new());
    let first = apply(
        &mut view,
        &as_map(vec![doc("games/a", 1, 10), doc("games/b", 1, 20), doc("games/c", 1, 30)]),
    );
    let s1 = contents(&first);
    assert_eq!(replay(&BTreeMap::new(), &first), s1);

    // Modify one, delete one, add one.
    let second = apply(
        &mut view,
        &as_map(vec![doc("games/a", 2, 40), deleted("games/b", 2), doc("games/d", 2, 5)]),
    );
    let s2 = contents(&second);
    assert_eq!(replay(&s1, &second), s2);

    let keys: Vec<String> = second.docs.keys().map(|key| key.to_string()).collect();
    assert_eq!(keys, vec!["games/d", "games/c", "games/a"]);
    let kinds: Vec<ChangeType> = second.doc_changes.iter().map(|change| change.change_type).collect();
    assert_eq!(kinds, vec![ChangeType::Removed, ChangeType::Added, ChangeType::Modified]);
}

#[test]
fn documents_leaving_the_query_are_reported_as_removed() {
    let query = Query::new(ResourcePath::from_string("games").unwrap());
    let mut view = View::new(query, BTreeSet::new());
    let first = apply(&mut view, &as_map(vec![doc("games/a", 1, 1)]));
    let s1 = contents(&first);

    // A document of another collection never enters the view.
    let second = apply(&mut view, &as_map(vec![deleted("games/a", 2), doc("other/x", 2, 1)]));
    assert_eq!(replay(&s1, &second), contents(&second));
    assert!(second.docs.is_empty());
}

#[test]
fn unchanged_documents_raise_no_snapshot() {
    let query = Query::new(ResourcePath::from_string("games").unwrap());
    let mut view = View::new(query, BTreeSet::new());
    apply(&mut view, &as_map(vec![doc("games/a", 1, 1)]));

    let doc_changes = view
        .compute_doc_changes(&as_map(vec![doc("games/a", 1, 1)]), None)
        .unwrap();
    assert!(view.apply_changes(doc_changes, false, None, false).snapshot.is_none());
}
