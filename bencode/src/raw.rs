//! Byte-slice bencode parsing, kept deliberately separate from the serde
//! `Serializer`/`Deserializer` pair in the rest of this crate. The serde
//! path is convenient for mapping a `.torrent` dictionary onto a struct, but
//! it round-trips through a re-serialization that is not guaranteed to be
//! byte-identical to the original input (key order, non-canonical integer
//! forms, unknown keys). Info-hash computation needs the exact original
//! bytes of the `info` dictionary, so this module walks the input directly
//! and reports byte offsets instead of producing owned values eagerly.

use crate::error::{Error, Result};

/// A parsed bencode value borrowing from the original byte slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Int(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(Vec<(&'a [u8], Value<'a>)>),
}

impl<'a> Value<'a> {
    pub fn as_dict(&self) -> Option<&[(&'a [u8], Value<'a>)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.as_dict()?.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Parses a single bencode value starting at `offset`, returning the value
/// and the offset immediately following it.
pub fn parse_value(b: &[u8], offset: usize) -> Result<(Value<'_>, usize)> {
    match b.get(offset) {
        Some(b'i') => parse_int(b, offset),
        Some(b'l') => parse_list(b, offset),
        Some(b'd') => parse_dict(b, offset),
        Some(c) if c.is_ascii_digit() => parse_bytes(b, offset),
        Some(c) => Err(Error::InvalidToken {
            expected: "one of i l d 0-9".into(),
            found: (*c as char).to_string(),
        }),
        None => Err(Error::EOF),
    }
}

/// Returns the offset immediately after the single bencode value starting
/// at `offset`, without constructing an owned `Value`. Used for extracting
/// byte ranges (e.g. the `info` dictionary) without copying.
pub fn skip_value(b: &[u8], offset: usize) -> Result<usize> {
    Ok(parse_value(b, offset)?.1)
}

/// Parses a complete bencoded buffer as a single top-level value.
pub fn parse(b: &[u8]) -> Result<Value<'_>> {
    let (value, end) = parse_value(b, 0)?;
    if end != b.len() {
        return Err(Error::Custom(format!(
            "trailing bytes after top-level value: {} of {}",
            end,
            b.len()
        )));
    }
    Ok(value)
}

fn parse_int(b: &[u8], offset: usize) -> Result<(Value<'_>, usize)> {
    debug_assert_eq!(b[offset], b'i');
    let start = offset + 1;
    let end = find(b, b'e', start)?;
    let s = std::str::from_utf8(&b[start..end])
        .map_err(|e| Error::Custom(format!("non-utf8 integer: {e}")))?;
    let n: i64 = s
        .parse()
        .map_err(|e| Error::Custom(format!("invalid integer {s:?}: {e}")))?;
    Ok((Value::Int(n), end + 1))
}

fn parse_bytes(b: &[u8], offset: usize) -> Result<(Value<'_>, usize)> {
    let colon = find(b, b':', offset)?;
    let len_str = std::str::from_utf8(&b[offset..colon])
        .map_err(|e| Error::Custom(format!("non-utf8 length prefix: {e}")))?;
    let len: usize = len_str
        .parse()
        .map_err(|e| Error::Custom(format!("invalid length prefix {len_str:?}: {e}")))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::Custom("length overflow".into()))?;
    if end > b.len() {
        return Err(Error::EOF);
    }
    Ok((Value::Bytes(&b[start..end]), end))
}

fn parse_list(b: &[u8], offset: usize) -> Result<(Value<'_>, usize)> {
    debug_assert_eq!(b[offset], b'l');
    let mut pos = offset + 1;
    let mut items = Vec::new();
    loop {
        match b.get(pos) {
            Some(b'e') => return Ok((Value::List(items), pos + 1)),
            Some(_) => {
                let (v, next) = parse_value(b, pos)?;
                items.push(v);
                pos = next;
            }
            None => return Err(Error::EOF),
        }
    }
}

fn parse_dict(b: &[u8], offset: usize) -> Result<(Value<'_>, usize)> {
    debug_assert_eq!(b[offset], b'd');
    let mut pos = offset + 1;
    let mut entries = Vec::new();
    loop {
        match b.get(pos) {
            Some(b'e') => return Ok((Value::Dict(entries), pos + 1)),
            Some(c) if c.is_ascii_digit() => {
                let (key, next) = parse_bytes(b, pos)?;
                let key = key.as_bytes().expect("parse_bytes always yields Bytes");
                let (value, next) = parse_value(b, next)?;
                entries.push((key, value));
                pos = next;
            }
            Some(c) => {
                return Err(Error::InvalidToken {
                    expected: "dictionary key (byte string) or 'e'".into(),
                    found: (*c as char).to_string(),
                })
            }
            None => return Err(Error::EOF),
        }
    }
}

fn find(b: &[u8], needle: u8, from: usize) -> Result<usize> {
    b[from..]
        .iter()
        .position(|&c| c == needle)
        .map(|i| from + i)
        .ok_or(Error::EOF)
}

/// Returns the exact byte range `[start, end)` of the value associated with
/// `key` in the top-level dictionary, suitable for hashing without copying.
pub fn find_dict_value_range<'a>(b: &'a [u8], key: &[u8]) -> Result<std::ops::Range<usize>> {
    if b.first() != Some(&b'd') {
        return Err(Error::InvalidToken {
            expected: "dictionary".into(),
            found: "other".into(),
        });
    }
    let mut pos = 1usize;
    loop {
        match b.get(pos) {
            Some(b'e') => {
                return Err(Error::Custom(format!(
                    "key {:?} not found",
                    String::from_utf8_lossy(key)
                )))
            }
            Some(c) if c.is_ascii_digit() => {
                let (k, after_key) = parse_bytes(b, pos)?;
                let k = k.as_bytes().expect("parse_bytes always yields Bytes");
                let value_start = after_key;
                let value_end = skip_value(b, value_start)?;
                if k == key {
                    return Ok(value_start..value_end);
                }
                pos = value_end;
            }
            Some(c) => {
                return Err(Error::InvalidToken {
                    expected: "dictionary key (byte string) or 'e'".into(),
                    found: (*c as char).to_string(),
                })
            }
            None => return Err(Error::EOF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars() {
        assert_eq!(parse(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(parse(b"i-3e").unwrap(), Value::Int(-3));
        assert_eq!(parse(b"4:spam").unwrap(), Value::Bytes(b"spam"));
    }

    #[test]
    fn parses_list_and_dict() {
        let v = parse(b"l4:spami1ee").unwrap();
        assert_eq!(v, Value::List(vec![Value::Bytes(b"spam"), Value::Int(1)]));

        let v = parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(
            v,
            Value::Dict(vec![
                (&b"cow"[..], Value::Bytes(b"moo")),
                (&b"spam"[..], Value::Bytes(b"eggs")),
            ])
        );
    }

    #[test]
    fn skip_value_handles_binary_payloads_with_delimiter_lookalikes() {
        // The 6-byte "pieces" payload below contains bytes that look like
        // bencode delimiters ('d', 'l', 'e', ':'), which must not confuse
        // length-prefixed byte-string skipping.
        let tricky = b"d6:pieces6:dle:0x3:fooi7ee";
        let v = parse(tricky).unwrap();
        let pieces = v.get(b"pieces").unwrap().as_bytes().unwrap();
        assert_eq!(pieces, b"dle:0x");
    }

    #[test]
    fn find_dict_value_range_is_byte_exact() {
        let buf = b"d4:infod4:name3:fooee";
        let range = find_dict_value_range(buf, b"info").unwrap();
        assert_eq!(&buf[range], &b"d4:name3:fooe"[..]);
    }

    #[test]
    fn find_dict_value_range_missing_key_errors() {
        let buf = b"d3:fooi1ee";
        assert!(find_dict_value_range(buf, b"info").is_err());
    }
}
