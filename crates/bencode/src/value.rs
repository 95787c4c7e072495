use std::collections::BTreeMap;

/// A parsed bencoded value.
///
/// Dict is backed by a `BTreeMap` so that iteration order is always
/// lexicographic by key, matching the wire requirement that dictionary
/// keys be sorted as raw byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<BValue>),
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BValue]> {
        match self {
            BValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&BValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn dict() -> BTreeMapBuilder {
        BTreeMapBuilder(BTreeMap::new())
    }
}

/// Small builder to keep call sites terse when constructing dict values.
pub struct BTreeMapBuilder(BTreeMap<Vec<u8>, BValue>);

impl BTreeMapBuilder {
    pub fn entry(mut self, key: &[u8], value: BValue) -> Self {
        self.0.insert(key.to_vec(), value);
        self
    }

    pub fn entry_opt(self, key: &[u8], value: Option<BValue>) -> Self {
        match value {
            Some(v) => self.entry(key, v),
            None => self,
        }
    }

    pub fn build(self) -> BValue {
        BValue::Dict(self.0)
    }
}
