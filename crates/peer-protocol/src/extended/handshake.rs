use std::collections::BTreeMap;

use bencode::BValue;

use crate::{MessageError, MY_UT_METADATA_ID};

pub const UT_METADATA: &[u8] = b"ut_metadata";

/// BEP 10 extension handshake. Only the fields this crawler actually reads
/// or writes are modeled; an unknown key in a peer's handshake dict is
/// ignored rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// extension name -> the *peer's* chosen local message id for it.
    pub m: BTreeMap<Vec<u8>, i64>,
    pub metadata_size: Option<u32>,
}

impl ExtendedHandshake {
    /// The handshake we send: advertises `ut_metadata` under the id we'll
    /// expect it tagged with in messages addressed to us.
    pub fn ours() -> Self {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_vec(), MY_UT_METADATA_ID as i64);
        ExtendedHandshake { m, metadata_size: None }
    }

    pub fn peer_ut_metadata_id(&self) -> Option<u8> {
        self.m.get(UT_METADATA.as_ref()).and_then(|v| u8::try_from(*v).ok())
    }

    pub fn to_value(&self) -> BValue {
        let m = BValue::Dict(self.m.iter().map(|(k, v)| (k.clone(), BValue::Int(*v))).collect());
        let mut b = BValue::dict().entry(b"m", m);
        if let Some(size) = self.metadata_size {
            b = b.entry(b"metadata_size", BValue::Int(size as i64));
        }
        b.build()
    }

    pub fn serialize(&self) -> Vec<u8> {
        bencode::encode(&self.to_value())
    }

    pub fn from_value(v: &BValue) -> Result<Self, MessageError> {
        let m_dict = v
            .get(b"m")
            .and_then(BValue::as_dict)
            .ok_or(MessageError::MalformedUtMetadata("missing m dict"))?;
        let mut m = BTreeMap::new();
        for (k, v) in m_dict {
            let id = v.as_int().ok_or(MessageError::MalformedUtMetadata("non-int extension id"))?;
            m.insert(k.clone(), id);
        }
        let metadata_size = match v.get(b"metadata_size") {
            Some(v) => Some(
                v.as_int()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or(MessageError::MalformedUtMetadata("bad metadata_size"))?,
            ),
            None => None,
        };
        Ok(ExtendedHandshake { m, metadata_size })
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, MessageError> {
        let value = bencode::decode(buf)?;
        Self::from_value(&value)
    }

    pub fn supports_ut_metadata(&self) -> bool {
        self.m.contains_key(UT_METADATA.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut hs = ExtendedHandshake::ours();
        hs.metadata_size = Some(65536);
        let bytes = hs.serialize();
        let parsed = ExtendedHandshake::deserialize(&bytes).unwrap();
        assert_eq!(hs, parsed);
        assert!(parsed.supports_ut_metadata());
        assert_eq!(parsed.peer_ut_metadata_id(), Some(MY_UT_METADATA_ID));
    }

    #[test]
    fn missing_ut_metadata_is_detected() {
        let hs = ExtendedHandshake { m: BTreeMap::new(), metadata_size: None };
        assert!(!hs.supports_ut_metadata());
    }

    #[test]
    fn rejects_missing_m_dict() {
        let v = BValue::dict().entry(b"metadata_size", BValue::Int(1)).build();
        assert!(ExtendedHandshake::from_value(&v).is_err());
    }
}
