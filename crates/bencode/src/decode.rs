use std::collections::BTreeMap;

use thiserror::Error;

use crate::value::BValue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("expected digit, found {0:#04x}")]
    ExpectedDigit(u8),
    #[error("invalid integer literal")]
    InvalidInteger,
    #[error("invalid string length prefix")]
    InvalidLength,
    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),
    #[error("trailing data after top-level value")]
    TrailingData,
}

/// Parses exactly one bencoded value, erroring if anything follows it.
pub fn decode(input: &[u8]) -> Result<BValue, DecodeError> {
    let (value, consumed) = decode_prefix(input)?;
    if consumed != input.len() {
        return Err(DecodeError::TrailingData);
    }
    Ok(value)
}

/// Parses one bencoded value from the front of `input` and returns it
/// along with the number of bytes it consumed, ignoring whatever follows.
/// Used by wire formats that append raw (non-bencoded) bytes after a
/// bencoded header, such as BEP 9's `ut_metadata` data message.
pub fn decode_prefix(input: &[u8]) -> Result<(BValue, usize), DecodeError> {
    let mut cursor = Cursor { buf: input, pos: 0 };
    let value = cursor.parse_value()?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::UnexpectedEof)
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn parse_value(&mut self) -> Result<BValue, DecodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes(),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }

    fn parse_int(&mut self) -> Result<BValue, DecodeError> {
        self.advance(1); // 'i'
        let start = self.pos;
        if self.peek()? == b'-' {
            self.advance(1);
        }
        let digits_start = self.pos;
        while self.peek()? != b'e' {
            let c = self.peek()?;
            if !c.is_ascii_digit() {
                return Err(DecodeError::ExpectedDigit(c));
            }
            self.advance(1);
        }
        if self.pos == digits_start {
            return Err(DecodeError::InvalidInteger);
        }
        let s = std::str::from_utf8(&self.buf[start..self.pos]).map_err(|_| DecodeError::InvalidInteger)?;
        let n: i64 = s.parse().map_err(|_| DecodeError::InvalidInteger)?;
        self.advance(1); // 'e'
        Ok(BValue::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<BValue, DecodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(DecodeError::InvalidLength);
            }
            self.advance(1);
        }
        let len_str = std::str::from_utf8(&self.buf[start..self.pos]).map_err(|_| DecodeError::InvalidLength)?;
        let len: usize = len_str.parse().map_err(|_| DecodeError::InvalidLength)?;
        self.advance(1); // ':'
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.advance(len);
        Ok(BValue::Bytes(bytes))
    }

    fn parse_list(&mut self) -> Result<BValue, DecodeError> {
        self.advance(1); // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.advance(1); // 'e'
        Ok(BValue::List(items))
    }

    fn parse_dict(&mut self) -> Result<BValue, DecodeError> {
        self.advance(1); // 'd'
        let mut map = BTreeMap::new();
        // Real-world DHT nodes aren't always strict about BEP 3's sorted-key
        // requirement; we accept any order on decode and only enforce it
        // ourselves when encoding. Later duplicate keys win.
        while self.peek()? != b'e' {
            let key = match self.parse_bytes()? {
                BValue::Bytes(b) => b,
                _ => unreachable!(),
            };
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.advance(1); // 'e'
        Ok(BValue::Dict(map))
    }
}
