//! Extended version (`xversion` / `xupdate`) key/value map
//!
//! Wire form: compact-size entry count, then per entry a compact-size key
//! and a length-prefixed value. Integer values are themselves compact-size
//! encoded inside the value bytes. Keys the receiver does not know are kept
//! but otherwise ignored.

use crate::codec::*;
use crate::error::Result;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XVersionMessage {
    pub entries: BTreeMap<u64, Vec<u8>>,
}

impl XVersionMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bytes(&mut self, key: u64, value: Vec<u8>) -> &mut Self {
        self.entries.insert(key, value);
        self
    }

    pub fn set_u64(&mut self, key: u64, value: u64) -> &mut Self {
        let mut bytes = Vec::with_capacity(9);
        write_compact_size(&mut bytes, value);
        self.entries.insert(key, bytes);
        self
    }

    pub fn get_bytes(&self, key: u64) -> Option<&[u8]> {
        self.entries.get(&key).map(|v| v.as_slice())
    }

    /// Integer stored under `key`; `None` if absent, error if the value is
    /// not a single compact size
    pub fn get_u64(&self, key: u64) -> Option<Result<u64>> {
        self.entries.get(&key).map(|bytes| {
            let mut reader = Reader::new(bytes);
            let value = reader.read_compact_size()?;
            reader.finish()?;
            Ok(value)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Encodable for XVersionMessage {
    fn encode_to(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.entries.len() as u64);
        for (key, value) in &self.entries {
            write_compact_size(out, *key);
            write_var_bytes(out, value);
        }
    }
}

impl Decodable for XVersionMessage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.read_count(2)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = reader.read_compact_size()?;
            let value = reader.read_var_bytes()?;
            entries.insert(key, value);
        }
        Ok(XVersionMessage { entries })
    }
}
