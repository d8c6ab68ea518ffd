use std::collections::BTreeMap;

use thiserror::Error;

const MAX_INPUT_LEN: usize = 64 * 1024 * 1024;
const MAX_DEPTH: usize = 32;
const MAX_INT_DIGITS: usize = 19;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,
    #[error("malformed bencode: {0}")]
    Malformed(String),
    #[error("value nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("input larger than {MAX_INPUT_LEN} bytes")]
    TooLarge,
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// A decoded bencode value borrowing from the input buffer. Byte strings
/// stay raw; callers decide whether a given field is text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Integer(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(BTreeMap<&'a [u8], Value<'a>>),
}

impl<'a> Value<'a> {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<&'a [u8], Value<'a>>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
    /// Byte span of the top-level dictionary's `info` value, captured while
    /// decoding so the info digest can run over the exact on-wire bytes.
    info_span: Option<(usize, usize)>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Result<Self> {
        if input.len() > MAX_INPUT_LEN {
            return Err(DecodeError::TooLarge);
        }
        Ok(Parser {
            input,
            pos: 0,
            depth: 0,
            info_span: None,
        })
    }

    fn current(&self) -> Result<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::Truncated)
    }

    fn expect(&mut self, wanted: u8) -> Result<()> {
        let got = self.current()?;
        if got != wanted {
            return Err(DecodeError::Malformed(format!(
                "expected '{}', found '{}'",
                wanted as char, got as char
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self) -> Result<Value<'a>> {
        if self.depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        match self.current()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            other => Err(DecodeError::Malformed(format!(
                "unexpected byte 0x{:02x}",
                other
            ))),
        }
    }

    fn integer(&mut self) -> Result<Value<'a>> {
        self.expect(b'i')?;
        let span_start = self.pos;
        let negative = self.current()? == b'-';
        if negative {
            self.pos += 1;
        }

        let digits_start = self.pos;
        while self.current()? != b'e' {
            if !self.input[self.pos].is_ascii_digit() {
                return Err(DecodeError::Malformed("non-digit in integer".into()));
            }
            self.pos += 1;
            if self.pos - digits_start > MAX_INT_DIGITS {
                return Err(DecodeError::Malformed("integer too long".into()));
            }
        }

        let digits = &self.input[digits_start..self.pos];
        if digits.is_empty() {
            return Err(DecodeError::Malformed("empty integer".into()));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(DecodeError::Malformed("integer has leading zero".into()));
        }
        if negative && digits == b"0" {
            return Err(DecodeError::Malformed("negative zero".into()));
        }

        // Sign and digits are validated ASCII; parsing the whole span keeps
        // i64::MIN representable.
        let text = std::str::from_utf8(&self.input[span_start..self.pos]).expect("ascii digits");
        let n: i64 = text
            .parse()
            .map_err(|_| DecodeError::Malformed("integer out of range".into()))?;

        self.expect(b'e')?;
        Ok(Value::Integer(n))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len_start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.input[len_start..self.pos];
        if digits.is_empty() {
            return Err(DecodeError::Malformed("missing string length".into()));
        }

        let text = std::str::from_utf8(digits).expect("ascii digits");
        let len: usize = text
            .parse()
            .map_err(|_| DecodeError::Malformed("string length out of range".into()))?;

        self.expect(b':')?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.input.len())
            .ok_or(DecodeError::Truncated)?;
        let data = &self.input[self.pos..end];
        self.pos = end;
        Ok(data)
    }

    fn list(&mut self) -> Result<Value<'a>> {
        self.expect(b'l')?;
        self.depth += 1;

        let mut items = Vec::new();
        while self.current()? != b'e' {
            items.push(self.value()?);
        }

        self.expect(b'e')?;
        self.depth -= 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self) -> Result<Value<'a>> {
        self.expect(b'd')?;
        self.depth += 1;
        let at_root = self.depth == 1;

        let mut entries = BTreeMap::new();
        let mut previous: Option<&[u8]> = None;

        while self.current()? != b'e' {
            let key = self.bytes()?;
            if let Some(prev) = previous {
                if key <= prev {
                    return Err(DecodeError::Malformed(
                        "dictionary keys not strictly ascending".into(),
                    ));
                }
            }
            previous = Some(key);

            let value_start = self.pos;
            let value = self.value()?;
            if at_root && key == b"info" {
                self.info_span = Some((value_start, self.pos));
            }
            entries.insert(key, value);
        }

        self.expect(b'e')?;
        self.depth -= 1;
        Ok(Value::Dict(entries))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.input.len() {
            return Err(DecodeError::Malformed("trailing bytes after value".into()));
        }
        Ok(())
    }
}

/// Decodes a complete bencode document; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut parser = Parser::new(input)?;
    let value = parser.value()?;
    parser.finish()?;
    Ok(value)
}

/// Like [`decode`], additionally reporting the `[start, end)` byte range of
/// the top-level dictionary's `info` value, when present.
pub fn decode_with_info_range(input: &[u8]) -> Result<(Value, Option<(usize, usize)>)> {
    let mut parser = Parser::new(input)?;
    let value = parser.value()?;
    parser.finish()?;
    Ok((value, parser.info_span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_span_covers_exact_value_bytes() {
        let doc = b"d8:announce7:http://4:infod6:lengthi3e4:name1:aee";
        let (_, span) = decode_with_info_range(doc).unwrap();
        let (start, end) = span.unwrap();
        assert_eq!(&doc[start..end], b"d6:lengthi3e4:name1:ae");
    }

    #[test]
    fn info_span_ignores_nested_info_keys() {
        let doc = b"d4:infoi2e5:outerd4:infoi1eee";
        let (_, span) = decode_with_info_range(doc).unwrap();
        let (start, end) = span.unwrap();
        assert_eq!(&doc[start..end], b"i2e");
    }

    #[test]
    fn info_span_absent_without_info_key() {
        let (_, span) = decode_with_info_range(b"d3:fooi1ee").unwrap();
        assert!(span.is_none());
    }

    #[test]
    fn rejects_unsorted_dict_keys() {
        assert!(matches!(
            decode(b"d4:spami1e3:cowi2ee"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert!(matches!(
            decode(b"d3:cowi1e3:cowi2ee"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert!(decode(b"di1ei2ee").is_err());
    }
}
