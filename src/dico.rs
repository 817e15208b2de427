//! Typed key/value dictionary serialized inside header items.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! count:u16
//! count × entry:
//!   key:u16 | type:u8 | len:u32 | value[len]
//! ```
//!
//! Value types: 1=u8, 2=u16, 3=u32, 4=u64, 5=byte string, 6=nested
//! dictionary (recursively encoded with the same layout).  Fixed-width
//! integers still carry their explicit length so a reader can validate an
//! entry before interpreting it.
//!
//! Encoders emit entries in ascending key order (keys live in a `BTreeMap`,
//! so this falls out of iteration).  Decoders accept entries in any order;
//! on duplicate keys the last entry wins.  Unknown type tags are corruption,
//! not extensions.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

const TYPE_U8: u8 = 1;
const TYPE_U16: u8 = 2;
const TYPE_U32: u8 = 3;
const TYPE_U64: u8 = 4;
const TYPE_BYTES: u8 = 5;
const TYPE_DICO: u8 = 6;

/// Hard cap on a single serialized value, shared with the framing layer.
/// Anything larger than this in a header is corruption.
const MAX_VALUE_LEN: u32 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DicoError {
    #[error("unknown value type tag {0}")]
    BadType(u8),
    #[error("value length {len} does not match type tag {tag}")]
    BadLength { tag: u8, len: u32 },
    #[error("value length {0} exceeds the dictionary limit")]
    Oversized(u32),
    #[error("key {key} has type {found}, expected {expected}")]
    TypeMismatch { key: u16, expected: &'static str, found: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single typed dictionary value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DicoValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
    Dico(Dico),
}

impl DicoValue {
    fn type_name(&self) -> &'static str {
        match self {
            DicoValue::U8(_) => "u8",
            DicoValue::U16(_) => "u16",
            DicoValue::U32(_) => "u32",
            DicoValue::U64(_) => "u64",
            DicoValue::Bytes(_) => "bytes",
            DicoValue::Dico(_) => "dico",
        }
    }
}

/// Typed key/value dictionary, the body of every header item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dico {
    entries: BTreeMap<u16, DicoValue>,
}

impl Dico {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: u16) -> bool {
        self.entries.contains_key(&key)
    }

    // ── Setters ──────────────────────────────────────────────────────────────

    pub fn set(&mut self, key: u16, value: DicoValue) {
        self.entries.insert(key, value);
    }

    pub fn set_u8(&mut self, key: u16, v: u8) {
        self.set(key, DicoValue::U8(v));
    }

    pub fn set_u16(&mut self, key: u16, v: u16) {
        self.set(key, DicoValue::U16(v));
    }

    pub fn set_u32(&mut self, key: u16, v: u32) {
        self.set(key, DicoValue::U32(v));
    }

    pub fn set_u64(&mut self, key: u16, v: u64) {
        self.set(key, DicoValue::U64(v));
    }

    pub fn set_bytes(&mut self, key: u16, v: impl Into<Vec<u8>>) {
        self.set(key, DicoValue::Bytes(v.into()));
    }

    pub fn set_dico(&mut self, key: u16, v: Dico) {
        self.set(key, DicoValue::Dico(v));
    }

    // ── Getters ──────────────────────────────────────────────────────────────

    pub fn get(&self, key: u16) -> Option<&DicoValue> {
        self.entries.get(&key)
    }

    pub fn get_u8(&self, key: u16) -> Result<Option<u8>, DicoError> {
        match self.entries.get(&key) {
            None => Ok(None),
            Some(DicoValue::U8(v)) => Ok(Some(*v)),
            Some(other) => Err(DicoError::TypeMismatch {
                key,
                expected: "u8",
                found: other.type_name(),
            }),
        }
    }

    pub fn get_u16(&self, key: u16) -> Result<Option<u16>, DicoError> {
        match self.entries.get(&key) {
            None => Ok(None),
            Some(DicoValue::U16(v)) => Ok(Some(*v)),
            Some(other) => Err(DicoError::TypeMismatch {
                key,
                expected: "u16",
                found: other.type_name(),
            }),
        }
    }

    pub fn get_u32(&self, key: u16) -> Result<Option<u32>, DicoError> {
        match self.entries.get(&key) {
            None => Ok(None),
            Some(DicoValue::U32(v)) => Ok(Some(*v)),
            Some(other) => Err(DicoError::TypeMismatch {
                key,
                expected: "u32",
                found: other.type_name(),
            }),
        }
    }

    /// Fetch an unsigned integer of any width, widened to u64.
    pub fn get_uint(&self, key: u16) -> Result<Option<u64>, DicoError> {
        match self.entries.get(&key) {
            None => Ok(None),
            Some(DicoValue::U8(v)) => Ok(Some(*v as u64)),
            Some(DicoValue::U16(v)) => Ok(Some(*v as u64)),
            Some(DicoValue::U32(v)) => Ok(Some(*v as u64)),
            Some(DicoValue::U64(v)) => Ok(Some(*v)),
            Some(other) => Err(DicoError::TypeMismatch {
                key,
                expected: "uint",
                found: other.type_name(),
            }),
        }
    }

    pub fn get_bytes(&self, key: u16) -> Result<Option<&[u8]>, DicoError> {
        match self.entries.get(&key) {
            None => Ok(None),
            Some(DicoValue::Bytes(v)) => Ok(Some(v)),
            Some(other) => Err(DicoError::TypeMismatch {
                key,
                expected: "bytes",
                found: other.type_name(),
            }),
        }
    }

    pub fn get_dico(&self, key: u16) -> Result<Option<&Dico>, DicoError> {
        match self.entries.get(&key) {
            None => Ok(None),
            Some(DicoValue::Dico(v)) => Ok(Some(v)),
            Some(other) => Err(DicoError::TypeMismatch {
                key,
                expected: "dico",
                found: other.type_name(),
            }),
        }
    }

    // ── Serialization ────────────────────────────────────────────────────────

    /// Serialized byte length of this dictionary.
    pub fn encoded_len(&self) -> usize {
        let mut len = 2;
        for value in self.entries.values() {
            len += 2 + 1 + 4 + Self::value_len(value);
        }
        len
    }

    fn value_len(value: &DicoValue) -> usize {
        match value {
            DicoValue::U8(_) => 1,
            DicoValue::U16(_) => 2,
            DicoValue::U32(_) => 4,
            DicoValue::U64(_) => 8,
            DicoValue::Bytes(b) => b.len(),
            DicoValue::Dico(d) => d.encoded_len(),
        }
    }

    /// Write the dictionary in ascending key order.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), DicoError> {
        w.write_u16::<LittleEndian>(self.entries.len() as u16)?;
        for (&key, value) in &self.entries {
            w.write_u16::<LittleEndian>(key)?;
            match value {
                DicoValue::U8(v) => {
                    w.write_u8(TYPE_U8)?;
                    w.write_u32::<LittleEndian>(1)?;
                    w.write_u8(*v)?;
                }
                DicoValue::U16(v) => {
                    w.write_u8(TYPE_U16)?;
                    w.write_u32::<LittleEndian>(2)?;
                    w.write_u16::<LittleEndian>(*v)?;
                }
                DicoValue::U32(v) => {
                    w.write_u8(TYPE_U32)?;
                    w.write_u32::<LittleEndian>(4)?;
                    w.write_u32::<LittleEndian>(*v)?;
                }
                DicoValue::U64(v) => {
                    w.write_u8(TYPE_U64)?;
                    w.write_u32::<LittleEndian>(8)?;
                    w.write_u64::<LittleEndian>(*v)?;
                }
                DicoValue::Bytes(b) => {
                    w.write_u8(TYPE_BYTES)?;
                    w.write_u32::<LittleEndian>(b.len() as u32)?;
                    w.write_all(b)?;
                }
                DicoValue::Dico(d) => {
                    w.write_u8(TYPE_DICO)?;
                    w.write_u32::<LittleEndian>(d.encoded_len() as u32)?;
                    d.write(w)?;
                }
            }
        }
        Ok(())
    }

    /// Serialize to a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DicoError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write(&mut out)?;
        Ok(out)
    }

    /// Read a dictionary, accepting entries in any order.
    pub fn read<R: Read>(r: &mut R) -> Result<Self, DicoError> {
        let count = r.read_u16::<LittleEndian>()?;
        let mut dico = Dico::new();
        for _ in 0..count {
            let key = r.read_u16::<LittleEndian>()?;
            let tag = r.read_u8()?;
            let len = r.read_u32::<LittleEndian>()?;
            if len > MAX_VALUE_LEN {
                return Err(DicoError::Oversized(len));
            }
            let value = match (tag, len) {
                (TYPE_U8, 1) => DicoValue::U8(r.read_u8()?),
                (TYPE_U16, 2) => DicoValue::U16(r.read_u16::<LittleEndian>()?),
                (TYPE_U32, 4) => DicoValue::U32(r.read_u32::<LittleEndian>()?),
                (TYPE_U64, 8) => DicoValue::U64(r.read_u64::<LittleEndian>()?),
                (TYPE_BYTES, n) => {
                    let mut buf = vec![0u8; n as usize];
                    r.read_exact(&mut buf)?;
                    DicoValue::Bytes(buf)
                }
                (TYPE_DICO, n) => {
                    // Bound the nested read to the declared length so a bad
                    // inner count cannot consume the outer stream.
                    let mut buf = vec![0u8; n as usize];
                    r.read_exact(&mut buf)?;
                    Dico::read(&mut &buf[..]).map(DicoValue::Dico)?
                }
                (TYPE_U8 | TYPE_U16 | TYPE_U32 | TYPE_U64, n) => {
                    return Err(DicoError::BadLength { tag, len: n })
                }
                (other, _) => return Err(DicoError::BadType(other)),
            };
            // Duplicate keys: last wins.
            dico.entries.insert(key, value);
        }
        Ok(dico)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DicoError> {
        Self::read(&mut &bytes[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Dico {
        let mut d = Dico::new();
        d.set_u8(7, 0xAB);
        d.set_u16(3, 0xBEEF);
        d.set_u32(1, 0xDEAD_BEEF);
        d.set_u64(9, u64::MAX - 1);
        d.set_bytes(5, b"hello/world".to_vec());
        let mut nested = Dico::new();
        nested.set_u32(1, 42);
        nested.set_bytes(2, b"inner".to_vec());
        d.set_dico(11, nested);
        d
    }

    #[test]
    fn round_trip_all_types() {
        let d = sample();
        let bytes = d.to_bytes().unwrap();
        assert_eq!(bytes.len(), d.encoded_len());
        let back = Dico::from_bytes(&bytes).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.get_uint(3).unwrap(), Some(0xBEEF));
        assert_eq!(back.get_bytes(5).unwrap(), Some(&b"hello/world"[..]));
        assert_eq!(
            back.get_dico(11).unwrap().unwrap().get_u32(1).unwrap(),
            Some(42)
        );
    }

    #[test]
    fn encoder_emits_ascending_keys() {
        let mut d = Dico::new();
        d.set_u8(40, 4);
        d.set_u8(10, 1);
        d.set_u8(30, 3);
        let bytes = d.to_bytes().unwrap();
        // count(2) then entries of 8 bytes each (2+1+4+1).
        let keys: Vec<u16> = (0..3)
            .map(|i| u16::from_le_bytes([bytes[2 + i * 8], bytes[3 + i * 8]]))
            .collect();
        assert_eq!(keys, vec![10, 30, 40]);
    }

    #[test]
    fn decoder_accepts_any_order_and_last_duplicate_wins() {
        // count=3, keys 20, 10, 10 — out of order, with a duplicate.
        let mut bytes = vec![3, 0];
        for (key, val) in [(20u16, 0xAAu8), (10, 0x01), (10, 0x02)] {
            bytes.extend_from_slice(&key.to_le_bytes());
            bytes.push(TYPE_U8);
            bytes.extend_from_slice(&1u32.to_le_bytes());
            bytes.push(val);
        }
        let d = Dico::from_bytes(&bytes).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d.get_u8(20).unwrap(), Some(0xAA));
        assert_eq!(d.get_u8(10).unwrap(), Some(0x02));
    }

    #[test]
    fn unknown_type_tag_is_corruption() {
        let bytes = [1u8, 0, 1, 0, 99, 1, 0, 0, 0, 0];
        assert!(matches!(
            Dico::from_bytes(&bytes),
            Err(DicoError::BadType(99))
        ));
    }

    #[test]
    fn fixed_width_length_must_match_tag() {
        // u32 tag with len=2.
        let mut bytes = vec![1u8, 0, 1, 0, TYPE_U32];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            Dico::from_bytes(&bytes),
            Err(DicoError::BadLength { tag: TYPE_U32, len: 2 })
        ));
    }

    #[test]
    fn type_mismatch_reported_on_access() {
        let mut d = Dico::new();
        d.set_bytes(1, b"x".to_vec());
        assert!(matches!(
            d.get_u32(1),
            Err(DicoError::TypeMismatch { key: 1, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            u8s in proptest::collection::btree_map(0u16..200, any::<u8>(), 0..8),
            blobs in proptest::collection::btree_map(200u16..400, proptest::collection::vec(any::<u8>(), 0..256), 0..8),
            big in any::<u64>(),
        ) {
            let mut d = Dico::new();
            for (k, v) in &u8s { d.set_u8(*k, *v); }
            for (k, v) in &blobs { d.set_bytes(*k, v.clone()); }
            d.set_u64(500, big);
            let back = Dico::from_bytes(&d.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(back, d);
        }
    }
}
