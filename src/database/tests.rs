use super::*;
use crate::catalog::CollectionKind;
use crate::collections::KeyElement;
use tempfile::TempDir;

fn setup_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(&DatabaseConfig::new(temp_dir.path())).unwrap();
    (temp_dir, db)
}

fn ok(db: &mut Database, request: Request) {
    assert_eq!(db.execute(request), Response::Ok);
}

fn error_text(db: &mut Database, request: Request) -> String {
    match db.execute(request) {
        Response::Error(text) => text,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[test]
fn test_collections_listing() {
    let (_temp, mut db) = setup_test_db();
    ok(&mut db, Request::ItemCreate { name: "i".into() });
    ok(&mut db, Request::HashCreate { name: "h".into() });
    ok(&mut db, Request::ListCreate { name: "l".into() });
    ok(&mut db, Request::SortedCreate { name: "s".into() });

    let Response::Collections(collections) = db.execute(Request::List) else {
        panic!("expected collections");
    };
    let listed: Vec<_> = collections.into_iter().collect();
    assert_eq!(
        listed,
        vec![
            ("h".to_string(), CollectionKind::Hash),
            ("i".to_string(), CollectionKind::Item),
            ("l".to_string(), CollectionKind::List),
            ("s".to_string(), CollectionKind::Sorted),
        ]
    );

    ok(&mut db, Request::ListDrop { name: "l".into() });
    let Response::Collections(collections) = db.execute(Request::List) else {
        panic!("expected collections");
    };
    assert!(!collections.contains_key("l"));
}

#[test]
fn test_item_commands() {
    let (_temp, mut db) = setup_test_db();
    ok(&mut db, Request::ItemCreate { name: "i".into() });
    assert!(error_text(&mut db, Request::ItemGet { name: "i".into() }).starts_with("ItemNotSet: "));

    ok(&mut db, Request::ItemSet { name: "i".into(), value: vec![9, 8, 7] });
    assert_eq!(db.execute(Request::ItemGet { name: "i".into() }), Response::Bytes(vec![9, 8, 7]));
}

#[test]
fn test_hash_scenario() {
    let (_temp, mut db) = setup_test_db();
    ok(&mut db, Request::HashCreate { name: "h".into() });
    ok(
        &mut db,
        Request::HashSet {
            name: "h".into(),
            key: vec![1, 2, 3],
            value: vec![4, 5, 6],
        },
    );
    let get = Request::HashGet {
        name: "h".into(),
        key: vec![1, 2, 3],
    };
    assert_eq!(db.execute(get.clone()), Response::OptionalBytes(Some(vec![4, 5, 6])));
    assert_eq!(db.execute(Request::HashSize { name: "h".into() }), Response::Size(1));

    ok(
        &mut db,
        Request::HashDelete {
            name: "h".into(),
            key: vec![1, 2, 3],
        },
    );
    assert_eq!(db.execute(get), Response::OptionalBytes(None));
}

#[test]
fn test_hash_iteration_commands() {
    let (_temp, mut db) = setup_test_db();
    ok(&mut db, Request::HashCreate { name: "h".into() });
    for i in 0u8..3 {
        ok(
            &mut db,
            Request::HashSet {
                name: "h".into(),
                key: vec![i],
                value: vec![i * 2],
            },
        );
    }

    let Response::Iter(iter) = db.execute(Request::HashIter { name: "h".into() }) else {
        panic!("expected an iterator");
    };
    let text = error_text(
        &mut db,
        Request::HashSet {
            name: "h".into(),
            key: vec![9],
            value: vec![],
        },
    );
    assert_eq!(text, "IteratorActive: Collection h has active iterators");

    let mut seen = Vec::new();
    loop {
        match db.execute(Request::HashIterNext { iter }) {
            Response::Pair(Some(pair)) => seen.push(pair),
            Response::Pair(None) => break,
            other => panic!("unexpected response {other:?}"),
        }
    }
    seen.sort();
    assert_eq!(seen, vec![(vec![0], vec![0]), (vec![1], vec![2]), (vec![2], vec![4])]);

    let text = error_text(&mut db, Request::HashIterBreak { iter });
    assert!(text.starts_with("UnknownIterator: "));
}

#[test]
fn test_list_commands() {
    let (_temp, mut db) = setup_test_db();
    ok(&mut db, Request::ListCreate { name: "l".into() });
    for value in [b"a", b"b", b"c"] {
        ok(
            &mut db,
            Request::ListInsert {
                name: "l".into(),
                index: None,
                value: value.to_vec(),
            },
        );
    }
    assert_eq!(
        db.execute(Request::ListGet { name: "l".into(), index: -1 }),
        Response::Bytes(b"c".to_vec())
    );
    assert_eq!(
        error_text(&mut db, Request::ListGet { name: "l".into(), index: 3 }),
        "OutOfBounds: Index 3 is out of bounds in list of size 3"
    );

    let Response::Iter(iter) = db.execute(Request::ListIter {
        name: "l".into(),
        start: Some(1),
        end: None,
    }) else {
        panic!("expected an iterator");
    };
    assert_eq!(
        db.execute(Request::ListIterNext { iter }),
        Response::OptionalBytes(Some(b"b".to_vec()))
    );
    ok(&mut db, Request::ListIterBreak { iter });

    assert_eq!(
        db.execute(Request::ListDelete { name: "l".into(), index: Some(0) }),
        Response::Bytes(b"a".to_vec())
    );
    assert_eq!(db.execute(Request::ListSize { name: "l".into() }), Response::Size(2));
}

#[test]
fn test_sorted_scenario() {
    let (_temp, mut db) = setup_test_db();
    ok(&mut db, Request::SortedCreate { name: "s".into() });
    let entries = [("a", 3, 1u8), ("b", 1, 2), ("b", 2, 3)];
    for (s, i, v) in entries {
        ok(
            &mut db,
            Request::SortedInsert {
                name: "s".into(),
                key: vec![KeyElement::String(s.into()), KeyElement::Int(i)],
                value: vec![v],
            },
        );
    }

    let response = db.execute(Request::SortedGet {
        name: "s".into(),
        key: vec![KeyElement::String("b".into())],
    });
    let Response::Pairs(pairs) = response else {
        panic!("expected pairs");
    };
    let values: Vec<_> = pairs.iter().map(|(_, value)| value.clone()).collect();
    assert_eq!(values, vec![vec![2], vec![3]]);

    let text = error_text(
        &mut db,
        Request::SortedInsert {
            name: "s".into(),
            key: vec![KeyElement::Uniquifier(1)],
            value: vec![],
        },
    );
    assert_eq!(text, "ReservedKeyElement: Key cannot include uniquifier");

    let text = error_text(
        &mut db,
        Request::SortedDelete {
            name: "s".into(),
            key: vec![KeyElement::String("c".into()), KeyElement::Int(0)],
        },
    );
    assert!(text.starts_with("NoMatchingKey: "));
}

#[test]
fn test_collection_errors() {
    let (_temp, mut db) = setup_test_db();
    assert_eq!(
        error_text(&mut db, Request::HashSize { name: "missing".into() }),
        "NotFound: Collection missing does not exist"
    );

    ok(&mut db, Request::ListCreate { name: "l".into() });
    assert_eq!(
        error_text(&mut db, Request::HashSize { name: "l".into() }),
        "WrongType: Collection l is not a hash"
    );
    assert_eq!(
        error_text(&mut db, Request::SortedCreate { name: "l".into() }),
        "AlreadyExists: Collection l already exists"
    );
}

#[test]
fn test_reopen_preserves_collections() {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig::new(temp_dir.path());
    {
        let mut db = Database::open(&config).unwrap();
        ok(&mut db, Request::HashCreate { name: "h".into() });
        ok(&mut db, Request::ListCreate { name: "l".into() });
        for i in 0u32..500 {
            ok(
                &mut db,
                Request::HashSet {
                    name: "h".into(),
                    key: i.to_le_bytes().to_vec(),
                    value: vec![1; 40],
                },
            );
            ok(
                &mut db,
                Request::ListInsert {
                    name: "l".into(),
                    index: None,
                    value: i.to_le_bytes().to_vec(),
                },
            );
        }
        db.shutdown().unwrap();
    }

    let mut db = Database::open(&config).unwrap();
    assert_eq!(db.execute(Request::HashSize { name: "h".into() }), Response::Size(500));
    assert_eq!(
        db.execute(Request::HashGet {
            name: "h".into(),
            key: 321u32.to_le_bytes().to_vec(),
        }),
        Response::OptionalBytes(Some(vec![1; 40]))
    );
    assert_eq!(
        db.execute(Request::ListGet { name: "l".into(), index: 499 }),
        Response::Bytes(499u32.to_le_bytes().to_vec())
    );
}
