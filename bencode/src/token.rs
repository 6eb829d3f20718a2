use std::collections::HashMap;
use std::fmt;
use serde::Serialize;
use serde::ser::{SerializeSeq, SerializeMap};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

// Bencode types.
#[derive(Debug, PartialEq)]
pub enum Token {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<Token>),
    Dictionary(HashMap<Vec<u8>, Token>)
}

impl Serialize for Token {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where S: serde::Serializer 
    {
        match self {
            Token::Integer(int) => serializer.serialize_i64(*int),

            Token::ByteString(string) => serializer.serialize_bytes(string),

            Token::List(list) => {
                let mut seq = serializer.serialize_seq(Some(list.len()))?;
                for elem in list {
                    seq.serialize_element(elem)?;
                }
                seq.end()
            },

            Token::Dictionary(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (k, v) in dict {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            },
        }
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        deserializer.deserialize_any(TokenVisitor)
    }
}

struct TokenVisitor;

impl<'de> Visitor<'de> for TokenVisitor {
    type Value = Token;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a bencode value")
    }

    fn visit_i64<E>(self, v: i64) -> Result<Token, E> {
        Ok(Token::Integer(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Token, E> {
        Ok(Token::Integer(v as i64))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Token, E> {
        Ok(Token::ByteString(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Token, E> {
        Ok(Token::ByteString(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Token, A::Error>
        where A: SeqAccess<'de>
    {
        let mut list = Vec::new();
        while let Some(elem) = seq.next_element()? {
            list.push(elem);
        }
        Ok(Token::List(list))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Token, A::Error>
        where A: MapAccess<'de>
    {
        let mut dict = HashMap::new();
        while let Some((k, v)) = map.next_entry::<Token, Token>()? {
            let key = match k {
                Token::ByteString(b) => b,
                _ => return Err(de::Error::custom("dictionary keys must be byte strings")),
            };
            dict.insert(key, v);
        }
        Ok(Token::Dictionary(dict))
    }
}