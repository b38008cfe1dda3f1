use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use super::*;

fn setup() -> (TempDir, Storage, SortedCollection) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut storage = Storage::open(temp_dir.path(), 256).unwrap();
    let mut maps = SortedCollection::new();
    maps.create(&mut storage, "s").unwrap();
    (temp_dir, storage, maps)
}

fn int(i: i64) -> KeyElement {
    KeyElement::Int(i)
}

fn string(value: &str) -> KeyElement {
    KeyElement::String(value.to_string())
}

fn collect(
    maps: &mut SortedCollection,
    storage: &mut Storage,
    start: Option<&[KeyElement]>,
    end: Option<&[KeyElement]>,
    inclusive: bool,
) -> Vec<(Key, Vec<u8>)> {
    let handle = maps.iter(storage, "s", start, end, inclusive).unwrap();
    let mut entries = Vec::new();
    while let Some(entry) = maps.iter_next(storage, &handle).unwrap() {
        entries.push(entry);
    }
    entries
}

#[test]
fn test_prefix_get() {
    let (_temp_dir, mut storage, mut maps) = setup();
    maps.insert(&mut storage, "s", &[string("a"), int(3)], &[1]).unwrap();
    maps.insert(&mut storage, "s", &[string("b"), int(2)], &[3]).unwrap();
    maps.insert(&mut storage, "s", &[string("b"), int(1)], &[2]).unwrap();

    assert_eq!(
        maps.get(&mut storage, "s", &[string("b")]).unwrap(),
        vec![
            (vec![string("b"), int(1)], vec![2]),
            (vec![string("b"), int(2)], vec![3]),
        ]
    );
    assert_eq!(maps.get(&mut storage, "s", &[]).unwrap().len(), 3);
    assert!(maps.get(&mut storage, "s", &[string("c")]).unwrap().is_empty());
    assert!(maps.get(&mut storage, "s", &[string("a"), int(4)]).unwrap().is_empty());
    assert_eq!(maps.size(&mut storage, "s").unwrap(), 3);
}

#[test]
fn test_equal_keys_get_uniquifiers() {
    let (_temp_dir, mut storage, mut maps) = setup();
    for value in 1..=3u8 {
        maps.insert(&mut storage, "s", &[string("x")], &[value]).unwrap();
    }
    maps.insert(&mut storage, "s", &[string("w")], &[0]).unwrap();

    let entries = maps.get(&mut storage, "s", &[string("x")]).unwrap();
    assert_eq!(
        entries,
        vec![
            (vec![string("x"), KeyElement::Uniquifier(2)], vec![3]),
            (vec![string("x"), KeyElement::Uniquifier(1)], vec![2]),
            (vec![string("x"), KeyElement::Uniquifier(0)], vec![1]),
        ]
    );

    // The newest of the equal keys goes first
    maps.remove(&mut storage, "s", &[string("x")]).unwrap();
    maps.remove(&mut storage, "s", &[string("x"), KeyElement::Uniquifier(0)]).unwrap();
    assert!(matches!(
        maps.remove(&mut storage, "s", &[string("x"), KeyElement::Uniquifier(0)]),
        Err(CollectionError::NoMatchingKey)
    ));
    assert_eq!(
        maps.get(&mut storage, "s", &[string("x")]).unwrap(),
        vec![(vec![string("x"), KeyElement::Uniquifier(1)], vec![2])]
    );
    assert_eq!(maps.size(&mut storage, "s").unwrap(), 2);
}

#[test]
fn test_key_errors() {
    let (_temp_dir, mut storage, mut maps) = setup();
    assert!(matches!(
        maps.insert(&mut storage, "s", &[int(1), KeyElement::Uniquifier(0)], b"v"),
        Err(CollectionError::ReservedKeyElement)
    ));

    maps.insert(&mut storage, "s", &[int(1), int(2)], b"v").unwrap();
    assert!(matches!(
        maps.insert(&mut storage, "s", &[string("1")], b"v"),
        Err(CollectionError::KeyTypeMismatch { .. })
    ));
    assert!(matches!(
        maps.get(&mut storage, "s", &[KeyElement::Float(1.0)]),
        Err(CollectionError::KeyTypeMismatch { .. })
    ));

    // Removal needs the whole key, not a prefix
    assert!(matches!(
        maps.remove(&mut storage, "s", &[int(1)]),
        Err(CollectionError::NoMatchingKey)
    ));
    assert!(matches!(
        maps.remove(&mut storage, "s", &[int(1), int(3)]),
        Err(CollectionError::NoMatchingKey)
    ));
    maps.remove(&mut storage, "s", &[int(1), int(2)]).unwrap();
    assert_eq!(maps.size(&mut storage, "s").unwrap(), 0);

    let long_key = [string(&"k".repeat(MAX_KEY_SIZE))];
    assert!(matches!(
        maps.insert(&mut storage, "s", &long_key, b"v"),
        Err(CollectionError::RecordTooLarge { .. })
    ));
    assert!(matches!(
        maps.insert(&mut storage, "s", &[int(5)], &vec![0; PAGE_SIZE]),
        Err(CollectionError::RecordTooLarge { .. })
    ));
    assert_eq!(maps.size(&mut storage, "s").unwrap(), 0);
}

#[test]
fn test_matches_reference_model() {
    let (_temp_dir, mut storage, mut maps) = setup();
    let mut rng = StdRng::seed_from_u64(11);
    let mut ids: Vec<i64> = (0..3000).map(|i| i * 2).collect();
    ids.shuffle(&mut rng);

    for id in &ids {
        let value = vec![(*id % 251) as u8; rng.random_range(1..40)];
        maps.insert(&mut storage, "s", &[int(*id), string("row")], &value).unwrap();
    }
    assert_eq!(maps.size(&mut storage, "s").unwrap(), 3000);

    let all = collect(&mut maps, &mut storage, None, None, false);
    let keys: Vec<i64> = all
        .iter()
        .map(|(key, _)| match key[0] {
            KeyElement::Int(i) => i,
            _ => panic!("unexpected key {key:?}"),
        })
        .collect();
    let expected: Vec<i64> = (0..3000).map(|i| i * 2).collect();
    assert_eq!(keys, expected);

    for _ in 0..50 {
        let low = rng.random_range(-10..6010);
        let high = rng.random_range(low..6020);
        let inclusive = rng.random_bool(0.5);
        let range = collect(
            &mut maps,
            &mut storage,
            Some(&[int(low)][..]),
            Some(&[int(high)][..]),
            inclusive,
        );
        let expected: Vec<i64> = (0..3000)
            .map(|i| i * 2)
            .filter(|id| *id >= low && (*id < high || (inclusive && *id == high)))
            .collect();
        let found: Vec<i64> = range
            .iter()
            .map(|(key, _)| match key[0] {
                KeyElement::Int(i) => i,
                _ => panic!("unexpected key {key:?}"),
            })
            .collect();
        assert_eq!(found, expected, "range {low}..{high} inclusive={inclusive}");
    }

    // Remove half in random order and check the survivors
    let (removed, kept) = ids.split_at(1500);
    for id in removed {
        maps.remove(&mut storage, "s", &[int(*id), string("row")]).unwrap();
    }
    for id in kept.iter().take(200) {
        let entries = maps.get(&mut storage, "s", &[int(*id)]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1[0], (*id % 251) as u8);
    }
    for id in removed.iter().take(200) {
        assert!(maps.get(&mut storage, "s", &[int(*id)]).unwrap().is_empty());
    }
    assert_eq!(collect(&mut maps, &mut storage, None, None, false).len(), 1500);
}

#[test]
fn test_many_duplicates() {
    let (_temp_dir, mut storage, mut maps) = setup();
    maps.insert(&mut storage, "s", &[int(1)], b"before").unwrap();
    maps.insert(&mut storage, "s", &[int(9)], b"after").unwrap();
    for i in 0..600u32 {
        maps.insert(&mut storage, "s", &[int(5)], &i.to_le_bytes()).unwrap();
    }
    assert!(maps.stats(&mut storage, "s").unwrap().depth >= 1);

    let run = maps.get(&mut storage, "s", &[int(5)]).unwrap();
    assert_eq!(run.len(), 600);
    for (offset, (key, value)) in run.iter().enumerate() {
        let inserted = 599 - offset as u32;
        assert_eq!(key, &vec![int(5), KeyElement::Uniquifier(inserted as u64)]);
        assert_eq!(value, &inserted.to_le_bytes());
    }

    // Each removal takes the newest remaining duplicate
    for i in (0..600u32).rev() {
        let newest = maps.get(&mut storage, "s", &[int(5)]).unwrap();
        assert_eq!(newest[0].1, i.to_le_bytes());
        maps.remove(&mut storage, "s", &[int(5)]).unwrap();
    }
    assert!(matches!(
        maps.remove(&mut storage, "s", &[int(5)]),
        Err(CollectionError::NoMatchingKey)
    ));
    let rest = collect(&mut maps, &mut storage, None, None, false);
    assert_eq!(
        rest,
        vec![(vec![int(1)], b"before".to_vec()), (vec![int(9)], b"after".to_vec())]
    );
}

#[test]
fn test_pages_reclaimed_after_deletes() {
    let (_temp_dir, mut storage, mut maps) = setup();
    let baseline = maps.stats(&mut storage, "s").unwrap();
    assert_eq!(baseline.depth, 0);
    assert_eq!(baseline.pages_in_use(), 2);

    let mut rng = StdRng::seed_from_u64(5);
    let mut ids: Vec<i64> = (0..2500).collect();
    ids.shuffle(&mut rng);
    for id in &ids {
        maps.insert(&mut storage, "s", &[int(*id)], &[7u8; 500]).unwrap();
    }
    let grown = maps.stats(&mut storage, "s").unwrap();
    assert!(grown.depth >= 2);

    ids.shuffle(&mut rng);
    for (removed, id) in ids.iter().enumerate() {
        maps.remove(&mut storage, "s", &[int(*id)]).unwrap();
        assert_eq!(maps.size(&mut storage, "s").unwrap(), 2500 - removed as u64 - 1);
    }
    let shrunk = maps.stats(&mut storage, "s").unwrap();
    assert_eq!(shrunk.depth, 0);
    assert_eq!(shrunk.pages_in_use(), 2);
    assert!(collect(&mut maps, &mut storage, None, None, true).is_empty());

    // Freed pages are reused before the file grows
    let page_count = shrunk.page_count;
    for id in 0..200 {
        maps.insert(&mut storage, "s", &[int(id)], &[1u8; 500]).unwrap();
    }
    assert_eq!(maps.stats(&mut storage, "s").unwrap().page_count, page_count);
}

#[test]
fn test_iteration_bounds() {
    let (_temp_dir, mut storage, mut maps) = setup();
    for (name, score) in [("ann", 3.5), ("bob", 1.0), ("bob", 2.5), ("cat", 0.5)] {
        maps.insert(&mut storage, "s", &[string(name), KeyElement::Float(score)], name.as_bytes())
            .unwrap();
    }

    let names = |entries: Vec<(Key, Vec<u8>)>| -> Vec<Vec<u8>> {
        entries.into_iter().map(|(_, value)| value).collect()
    };
    assert_eq!(
        names(collect(&mut maps, &mut storage, Some(&[string("b")][..]), None, false)),
        vec![b"bob".to_vec(), b"bob".to_vec(), b"cat".to_vec()]
    );
    assert_eq!(
        names(collect(&mut maps, &mut storage, None, Some(&[string("bob")][..]), false)),
        vec![b"ann".to_vec()]
    );
    assert_eq!(
        names(collect(&mut maps, &mut storage, None, Some(&[string("bob")][..]), true)),
        vec![b"ann".to_vec(), b"bob".to_vec(), b"bob".to_vec()]
    );
    let scores = collect(
        &mut maps,
        &mut storage,
        Some(&[string("bob"), KeyElement::Float(2.0)][..]),
        Some(&[string("bob")][..]),
        true,
    );
    assert_eq!(scores, vec![(vec![string("bob"), KeyElement::Float(2.5)], b"bob".to_vec())]);
}

#[test]
fn test_iterators_block_mutation() {
    let (_temp_dir, mut storage, mut maps) = setup();
    maps.insert(&mut storage, "s", &[int(1)], b"a").unwrap();
    maps.insert(&mut storage, "s", &[int(2)], b"b").unwrap();

    let handle = maps.iter(&mut storage, "s", None, None, false).unwrap();
    assert!(matches!(
        maps.insert(&mut storage, "s", &[int(3)], b"c"),
        Err(CollectionError::IteratorActive(_))
    ));
    assert!(matches!(
        maps.remove(&mut storage, "s", &[int(1)]),
        Err(CollectionError::IteratorActive(_))
    ));
    assert!(matches!(
        maps.drop(&mut storage, "s"),
        Err(CollectionError::IteratorActive(_))
    ));
    assert_eq!(maps.get(&mut storage, "s", &[int(2)]).unwrap().len(), 1);

    assert_eq!(
        maps.iter_next(&mut storage, &handle).unwrap(),
        Some((vec![int(1)], b"a".to_vec()))
    );
    assert_eq!(
        maps.iter_next(&mut storage, &handle).unwrap(),
        Some((vec![int(2)], b"b".to_vec()))
    );
    assert_eq!(maps.iter_next(&mut storage, &handle).unwrap(), None);
    assert!(matches!(
        maps.iter_next(&mut storage, &handle),
        Err(CollectionError::UnknownIterator(_))
    ));
    assert!(matches!(
        maps.iter_break(&handle),
        Err(CollectionError::UnknownIterator(_))
    ));

    maps.remove(&mut storage, "s", &[int(1)]).unwrap();
    maps.drop(&mut storage, "s").unwrap();
    assert!(matches!(
        maps.size(&mut storage, "s"),
        Err(CollectionError::NotFound(_))
    ));
}

#[test]
fn test_interleaved_duplicates_match_model() {
    // Few distinct keys and large values, so equal runs straddle leaves and
    // deletes keep leaving routing keys behind
    for seed in 0..12 {
        let (_temp_dir, mut storage, mut maps) = setup();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model: BTreeMap<i64, Vec<Vec<u8>>> = BTreeMap::new();

        for step in 0..250u32 {
            let id = rng.random_range(0..4);
            if rng.random_bool(0.6) {
                let mut value = vec![id as u8; 900];
                value[..4].copy_from_slice(&step.to_le_bytes());
                maps.insert(&mut storage, "s", &[int(id)], &value).unwrap();
                model.entry(id).or_default().push(value);
            } else {
                let result = maps.remove(&mut storage, "s", &[int(id)]);
                match model.get_mut(&id).and_then(Vec::pop) {
                    Some(_) => result.unwrap(),
                    None => assert!(
                        matches!(result, Err(CollectionError::NoMatchingKey)),
                        "seed {seed} step {step}: removed missing key {id}"
                    ),
                }
            }

            let all = collect(&mut maps, &mut storage, None, None, false);
            for pair in all.windows(2) {
                assert_eq!(
                    compare_keys(&pair[0].0, &pair[1].0).unwrap(),
                    Ordering::Less,
                    "seed {seed} step {step}: {:?} before {:?}",
                    pair[0].0,
                    pair[1].0
                );
            }
            let total: usize = model.values().map(Vec::len).sum();
            assert_eq!(all.len(), total, "seed {seed} step {step}");
            assert_eq!(maps.size(&mut storage, "s").unwrap(), total as u64);

            for (id, stack) in &model {
                let found: Vec<Vec<u8>> = maps
                    .get(&mut storage, "s", &[int(*id)])
                    .unwrap()
                    .into_iter()
                    .map(|(_, value)| value)
                    .collect();
                let newest_first: Vec<Vec<u8>> = stack.iter().rev().cloned().collect();
                assert_eq!(found, newest_first, "seed {seed} step {step}: key {id}");
            }
        }
    }
}

#[test]
fn test_prefix_keys_rejected() {
    let (_temp_dir, mut storage, mut maps) = setup();
    maps.insert(&mut storage, "s", &[string("a")], b"1").unwrap();
    assert!(matches!(
        maps.insert(&mut storage, "s", &[string("a"), int(1)], b"2"),
        Err(CollectionError::KeyPrefixConflict)
    ));

    maps.insert(&mut storage, "s", &[string("b"), int(1)], b"3").unwrap();
    assert!(matches!(
        maps.insert(&mut storage, "s", &[string("b")], b"4"),
        Err(CollectionError::KeyPrefixConflict)
    ));

    // Once uniquified, the stored keys hold a uniquifier where the longer
    // key holds an int
    maps.insert(&mut storage, "s", &[string("a")], b"5").unwrap();
    assert!(matches!(
        maps.insert(&mut storage, "s", &[string("a"), int(1)], b"6"),
        Err(CollectionError::KeyTypeMismatch { .. })
    ));

    assert_eq!(
        collect(&mut maps, &mut storage, None, None, false),
        vec![
            (vec![string("a"), KeyElement::Uniquifier(1)], b"5".to_vec()),
            (vec![string("a"), KeyElement::Uniquifier(0)], b"1".to_vec()),
            (vec![string("b"), int(1)], b"3".to_vec()),
        ]
    );
    maps.remove(&mut storage, "s", &[string("a")]).unwrap();
    maps.remove(&mut storage, "s", &[string("a")]).unwrap();
    assert!(matches!(
        maps.remove(&mut storage, "s", &[string("a")]),
        Err(CollectionError::NoMatchingKey)
    ));
    assert_eq!(maps.size(&mut storage, "s").unwrap(), 1);
}
