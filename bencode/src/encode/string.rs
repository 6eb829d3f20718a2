use serde::ser;
use crate::Error;

// Serializes a dictionary key down to its raw bytes, without the bencode
// byte-string length prefix the full `Encoder` would add - `SerializeMap`
// re-adds that prefix itself once keys are sorted. Only the primitive types
// that ever show up as map keys in this crate (strings, byte slices,
// integers) are supported.
pub struct StringSerializer;

fn unsupported(what: &str) -> Error {
    Error::InvalidType(format!("{what} is not a valid dictionary key"))
}

impl ser::Serializer for &mut StringSerializer {
    type Ok = Vec<u8>;
    type Error = Error;

    type SerializeSeq = ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant = ser::Impossible<Vec<u8>, Error>;
    type SerializeMap = ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct = ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = ser::Impossible<Vec<u8>, Error>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>, Error> {
        Ok(v.as_bytes().to_vec())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(v.to_vec())
    }

    fn serialize_i64(self, v: i64) -> Result<Vec<u8>, Error> {
        Ok(v.to_string().into_bytes())
    }

    fn serialize_u64(self, v: u64) -> Result<Vec<u8>, Error> {
        Ok(v.to_string().into_bytes())
    }

    fn serialize_i8(self, v: i8) -> Result<Vec<u8>, Error> { self.serialize_i64(v as i64) }
    fn serialize_i16(self, v: i16) -> Result<Vec<u8>, Error> { self.serialize_i64(v as i64) }
    fn serialize_i32(self, v: i32) -> Result<Vec<u8>, Error> { self.serialize_i64(v as i64) }
    fn serialize_u8(self, v: u8) -> Result<Vec<u8>, Error> { self.serialize_u64(v as u64) }
    fn serialize_u16(self, v: u16) -> Result<Vec<u8>, Error> { self.serialize_u64(v as u64) }
    fn serialize_u32(self, v: u32) -> Result<Vec<u8>, Error> { self.serialize_u64(v as u64) }

    fn serialize_char(self, v: char) -> Result<Vec<u8>, Error> {
        let mut buf = [0u8; 4];
        Ok(v.encode_utf8(&mut buf).as_bytes().to_vec())
    }

    fn serialize_bool(self, _v: bool) -> Result<Vec<u8>, Error> { Err(unsupported("bool")) }
    fn serialize_f32(self, _v: f32) -> Result<Vec<u8>, Error> { Err(unsupported("f32")) }
    fn serialize_f64(self, _v: f64) -> Result<Vec<u8>, Error> { Err(unsupported("f64")) }
    fn serialize_none(self) -> Result<Vec<u8>, Error> { Err(unsupported("none")) }
    fn serialize_unit(self) -> Result<Vec<u8>, Error> { Err(unsupported("unit")) }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Vec<u8>, Error>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<Vec<u8>, Error> {
        Err(unsupported(name))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Vec<u8>, Error> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<Vec<u8>, Error>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>, Error>
        where T: serde::Serialize
    {
        Err(unsupported(variant))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Error> { Err(unsupported("seq")) }
    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Error> { Err(unsupported("tuple")) }
    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeTupleStruct, Error> {
        Err(unsupported("tuple struct"))
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        Err(unsupported("tuple variant"))
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Error> { Err(unsupported("map")) }
    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct, Error> {
        Err(unsupported("struct"))
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        Err(unsupported("struct variant"))
    }
}
