use bencode::BValue;

use crate::MessageError;

const CHUNK_SIZE: u32 = core::CHUNK_SIZE;

/// A `ut_metadata` message: `request` asks for one piece, `data` carries
/// one piece's raw bytes appended after the bencoded header, `reject`
/// means the peer doesn't have the metadata at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtMetadata {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Vec<u8> },
    Reject { piece: u32 },
}

impl UtMetadata {
    pub fn piece(&self) -> u32 {
        match self {
            UtMetadata::Request { piece } => *piece,
            UtMetadata::Data { piece, .. } => *piece,
            UtMetadata::Reject { piece } => *piece,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let (msg_type, piece, total_size) = match self {
            UtMetadata::Request { piece } => (0i64, *piece, None),
            UtMetadata::Data { piece, total_size, .. } => (1i64, *piece, Some(*total_size)),
            UtMetadata::Reject { piece } => (2i64, *piece, None),
        };
        let mut dict = BValue::dict().entry(b"msg_type", BValue::Int(msg_type)).entry(b"piece", BValue::Int(piece as i64));
        if let Some(total_size) = total_size {
            dict = dict.entry(b"total_size", BValue::Int(total_size as i64));
        }
        let mut out = bencode::encode(&dict.build());
        if let UtMetadata::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, MessageError> {
        let (value, consumed) = bencode::decode_prefix(buf)?;
        let msg_type = value.get(b"msg_type").and_then(BValue::as_int).ok_or(MessageError::MalformedUtMetadata("missing msg_type"))?;
        let piece = value
            .get(b"piece")
            .and_then(BValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(MessageError::MalformedUtMetadata("missing or invalid piece"))?;
        match msg_type {
            0 => Ok(UtMetadata::Request { piece }),
            1 => {
                let total_size = value
                    .get(b"total_size")
                    .and_then(BValue::as_int)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or(MessageError::MalformedUtMetadata("data message missing total_size"))?;
                let data = buf[consumed..].to_vec();
                validate_piece(piece, total_size, data.len())?;
                Ok(UtMetadata::Data { piece, total_size, data })
            }
            2 => Ok(UtMetadata::Reject { piece }),
            _ => Err(MessageError::MalformedUtMetadata("unknown msg_type")),
        }
    }
}

/// Checks that a data message's piece index and payload length are
/// consistent with `total_size`: the last piece is short by whatever
/// remains after the preceding full 16 KiB pieces, every other piece is
/// exactly `CHUNK_SIZE`.
fn validate_piece(piece: u32, total_size: u32, len: usize) -> Result<(), MessageError> {
    if total_size == 0 {
        return Err(MessageError::MalformedUtMetadata("total_size is zero"));
    }
    let total_pieces = total_size.div_ceil(CHUNK_SIZE);
    if piece >= total_pieces {
        return Err(MessageError::MalformedUtMetadata("piece index out of bounds"));
    }
    let expected = total_size.saturating_sub(piece * CHUNK_SIZE).min(CHUNK_SIZE);
    if len as u32 != expected {
        return Err(MessageError::MalformedUtMetadata("piece size mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let m = UtMetadata::Request { piece: 3 };
        let bytes = m.serialize();
        assert_eq!(UtMetadata::deserialize(&bytes).unwrap(), m);
    }

    #[test]
    fn reject_round_trips() {
        let m = UtMetadata::Reject { piece: 1 };
        assert_eq!(UtMetadata::deserialize(&m.serialize()).unwrap(), m);
    }

    #[test]
    fn data_round_trips_with_trailing_raw_bytes() {
        let m = UtMetadata::Data { piece: 0, total_size: 3, data: b"foo".to_vec() };
        let bytes = m.serialize();
        assert_eq!(UtMetadata::deserialize(&bytes).unwrap(), m);
    }

    #[test]
    fn rejects_zero_total_size() {
        let bytes = UtMetadata::Data { piece: 0, total_size: 0, data: vec![] }.serialize();
        assert!(UtMetadata::deserialize(&bytes).is_err());
    }

    #[test]
    fn rejects_piece_out_of_bounds() {
        let bytes = UtMetadata::Data { piece: 1, total_size: 3, data: b"foo".to_vec() }.serialize();
        assert!(UtMetadata::deserialize(&bytes).is_err());
    }

    #[test]
    fn rejects_size_mismatch() {
        let bytes = UtMetadata::Data { piece: 0, total_size: 3, data: b"foobar".to_vec() }.serialize();
        assert!(UtMetadata::deserialize(&bytes).is_err());
    }

    #[test]
    fn last_piece_may_be_short() {
        let total = CHUNK_SIZE + 1;
        let bytes = UtMetadata::Data { piece: 1, total_size: total, data: vec![0u8; 1] }.serialize();
        assert!(UtMetadata::deserialize(&bytes).is_ok());
    }
}
