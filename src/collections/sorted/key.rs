use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, DecodeResult, Decoder, Encoder};

use crate::collections::{CollectionError, CollectionResult};

const INT_TAG: u8 = 0;
const FLOAT_TAG: u8 = 1;
const STRING_TAG: u8 = 2;
const UNIQUIFIER_TAG: u8 = 3;

/// One component of a sorted-map key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyElement {
    Int(i64),
    Float(f64),
    String(String),
    /// Appended by the map to tell equal keys apart; never supplied by clients
    Uniquifier(u64),
}

/// Keys are compared element by element, so a shorter key matches every
/// key it is a prefix of
pub type Key = Vec<KeyElement>;

impl KeyElement {
    pub fn type_name(&self) -> &'static str {
        match self {
            KeyElement::Int(_) => "int",
            KeyElement::Float(_) => "float",
            KeyElement::String(_) => "string",
            KeyElement::Uniquifier(_) => "uniquifier",
        }
    }

    fn compare(&self, other: &KeyElement) -> CollectionResult<Ordering> {
        match (self, other) {
            (KeyElement::Int(a), KeyElement::Int(b)) => Ok(a.cmp(b)),
            (KeyElement::Float(a), KeyElement::Float(b)) => Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal)),
            (KeyElement::String(a), KeyElement::String(b)) => Ok(a.cmp(b)),
            // Reversed, so the most recently inserted of equal keys comes first
            (KeyElement::Uniquifier(a), KeyElement::Uniquifier(b)) => Ok(b.cmp(a)),
            (a, b) => Err(CollectionError::KeyTypeMismatch {
                left: a.type_name(),
                right: b.type_name(),
            }),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            KeyElement::String(string) => 1 + 4 + string.len(),
            KeyElement::Int(_) | KeyElement::Float(_) | KeyElement::Uniquifier(_) => 1 + 8,
        }
    }

    fn encode(&self, encoder: &mut Encoder) {
        match self {
            KeyElement::Int(value) => {
                encoder.put_u8(INT_TAG);
                encoder.put_i64(*value);
            }
            KeyElement::Float(value) => {
                encoder.put_u8(FLOAT_TAG);
                encoder.put_f64(*value);
            }
            KeyElement::String(value) => {
                encoder.put_u8(STRING_TAG);
                encoder.put_bytes(value.as_bytes());
            }
            KeyElement::Uniquifier(value) => {
                encoder.put_u8(UNIQUIFIER_TAG);
                encoder.put_u64(*value);
            }
        }
    }

    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        match decoder.get_u8()? {
            INT_TAG => Ok(KeyElement::Int(decoder.get_i64()?)),
            FLOAT_TAG => Ok(KeyElement::Float(decoder.get_f64()?)),
            STRING_TAG => Ok(KeyElement::String(decoder.get_string()?)),
            UNIQUIFIER_TAG => Ok(KeyElement::Uniquifier(decoder.get_u64()?)),
            tag => Err(DecodeError::UnknownTag {
                what: "key element",
                tag,
            }),
        }
    }
}

/// Compare two keys over the elements they share. Elements in the same
/// position must have the same type.
pub fn compare_keys(left: &[KeyElement], right: &[KeyElement]) -> CollectionResult<Ordering> {
    for (a, b) in left.iter().zip(right) {
        let ordering = a.compare(b)?;
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

/// The trailing uniquifier of a key, if it has one
pub fn uniquifier(key: &[KeyElement]) -> Option<u64> {
    match key.last() {
        Some(KeyElement::Uniquifier(value)) => Some(*value),
        _ => None,
    }
}

/// Index of the first key that is not less than `target`, or `keys.len()`
pub fn lower_bound(keys: &[Key], target: &[KeyElement]) -> CollectionResult<usize> {
    for (index, key) in keys.iter().enumerate() {
        if compare_keys(key, target)? != Ordering::Less {
            return Ok(index);
        }
    }
    Ok(keys.len())
}

pub fn encoded_key_len(key: &[KeyElement]) -> usize {
    4 + key.iter().map(KeyElement::encoded_len).sum::<usize>()
}

pub fn encode_key(key: &[KeyElement], encoder: &mut Encoder) {
    encoder.put_len(key.len());
    for element in key {
        element.encode(encoder);
    }
}

pub fn decode_key(decoder: &mut Decoder<'_>) -> DecodeResult<Key> {
    let count = decoder.get_len()?;
    (0..count).map(|_| KeyElement::decode(decoder)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string(value: &str) -> KeyElement {
        KeyElement::String(value.to_string())
    }

    #[test]
    fn test_compare_shared_prefix() {
        let short = vec![string("b")];
        let long = vec![string("b"), KeyElement::Int(2)];
        assert_eq!(compare_keys(&short, &long).unwrap(), Ordering::Equal);
        assert_eq!(compare_keys(&[], &long).unwrap(), Ordering::Equal);

        let other = vec![string("b"), KeyElement::Int(10)];
        assert_eq!(compare_keys(&long, &other).unwrap(), Ordering::Less);
        assert_eq!(
            compare_keys(&[KeyElement::Float(-0.5)], &[KeyElement::Float(0.25)]).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_uniquifiers_sort_newest_first() {
        let older = vec![KeyElement::Int(1), KeyElement::Uniquifier(0)];
        let newer = vec![KeyElement::Int(1), KeyElement::Uniquifier(1)];
        assert_eq!(compare_keys(&newer, &older).unwrap(), Ordering::Less);
        assert_eq!(uniquifier(&newer), Some(1));
        assert_eq!(uniquifier(&[KeyElement::Int(1)]), None);
    }

    #[test]
    fn test_type_mismatch() {
        let err = compare_keys(&[KeyElement::Int(1)], &[string("1")]).unwrap_err();
        assert!(matches!(
            err,
            CollectionError::KeyTypeMismatch {
                left: "int",
                right: "string"
            }
        ));
    }

    #[test]
    fn test_lower_bound() {
        let keys: Vec<Key> = [1, 3, 5].iter().map(|i| vec![KeyElement::Int(*i)]).collect();
        assert_eq!(lower_bound(&keys, &[KeyElement::Int(0)]).unwrap(), 0);
        assert_eq!(lower_bound(&keys, &[KeyElement::Int(3)]).unwrap(), 1);
        assert_eq!(lower_bound(&keys, &[KeyElement::Int(4)]).unwrap(), 2);
        assert_eq!(lower_bound(&keys, &[KeyElement::Int(6)]).unwrap(), 3);
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        let key = vec![
            KeyElement::Int(-4),
            KeyElement::Float(2.5),
            string("hello"),
            KeyElement::Uniquifier(9),
        ];
        let mut encoder = Encoder::new();
        encode_key(&key, &mut encoder);
        let bytes = encoder.finish();
        assert_eq!(bytes.len(), encoded_key_len(&key));
        assert_eq!(decode_key(&mut Decoder::new(&bytes)).unwrap(), key);
    }

    #[test]
    fn test_serde_form() {
        let key = vec![string("a"), KeyElement::Int(3)];
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"[{"string":"a"},{"int":3}]"#);
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
