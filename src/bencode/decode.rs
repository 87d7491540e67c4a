use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 32;

/// Decodes exactly one bencode value; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser { input, pos: 0 };
    let value = parser.value(0)?;
    if parser.pos != input.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Str(self.string()?)),
            c => Err(BencodeError::UnexpectedByte(c, self.pos)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.pos += 1;

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
        if text.is_empty() || text == "-" {
            return Err(BencodeError::InvalidInteger);
        }
        // canonical form: no leading zeros, no negative zero
        if text.starts_with("-0") || (text.len() > 1 && text.starts_with('0')) {
            return Err(BencodeError::InvalidInteger);
        }
        text.parse()
            .map(Value::Int)
            .map_err(|_| BencodeError::InvalidInteger)
    }

    fn string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidLength);
            }
            self.pos += 1;
        }
        let len_digits = &self.input[start..self.pos];
        self.pos += 1;

        if len_digits.is_empty() || (len_digits.len() > 1 && len_digits[0] == b'0') {
            return Err(BencodeError::InvalidLength);
        }
        let len: usize = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;

        if self.input.len() - self.pos < len {
            return Err(BencodeError::Truncated);
        }
        let bytes = Bytes::copy_from_slice(&self.input[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        let mut last_key: Option<Bytes> = None;
        while self.peek()? != b'e' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.string()?;
            if let Some(prev) = &last_key {
                if *prev >= key {
                    return Err(BencodeError::UnorderedKeys);
                }
            }
            let value = self.value(depth + 1)?;
            last_key = Some(key.clone());
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }
}
