//! The binary encoding used for every packet on the wire.
//!
//! All integers are fixed-width big-endian; byte strings and UTF-8 strings
//! are prefixed with a 4-byte big-endian length; sequences are prefixed with
//! a 4-byte big-endian element count; struct and tuple fields are
//! concatenated in declaration order with no framing of their own. Shapes
//! that have no stable wire form (maps, enums, floats) are unsupported, so a
//! value that serializes at all serializes the same way everywhere.

use alloc::{
    boxed::Box,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;

use displaydoc::Display;
use serde::{de, ser, Deserialize, Serialize};

/// A failure to encode or decode a wire value.
#[derive(Debug, Clone, Display)]
pub enum WireError {
    /// unexpected end of input
    Eof,
    /// trailing bytes after the encoded value
    TrailingBytes,
    /// length prefix exceeds the addressable size
    LengthOverflow,
    /// malformed boolean tag {0}
    BadBool(u8),
    /// malformed option tag {0}
    BadOption(u8),
    /// malformed UTF-8 in a string
    BadUtf8,
    /// unsupported shape: {0}
    Unsupported(&'static str),
    /// {0}
    Custom(String),
}

impl ser::StdError for WireError {}

impl ser::Error for WireError {
    fn custom<T: fmt::Display>(message: T) -> Self {
        Self::Custom(message.to_string())
    }
}

impl de::Error for WireError {
    fn custom<T: fmt::Display>(message: T) -> Self {
        Self::Custom(message.to_string())
    }
}

/// Encodes `value` into its wire form.
pub fn to_bytes<T>(value: &T) -> Result<Box<[u8]>, WireError>
where
    T: Serialize + ?Sized,
{
    let mut serializer = Serializer { out: Vec::new() };
    value.serialize(&mut serializer)?;
    Ok(serializer.out.into_boxed_slice())
}

/// Decodes a value from its wire form, requiring the input to be consumed
/// exactly.
pub fn from_bytes<'de, T>(bytes: &'de [u8]) -> Result<T, WireError>
where
    T: Deserialize<'de>,
{
    let mut deserializer = Deserializer { input: bytes };
    let value = T::deserialize(&mut deserializer)?;
    if !deserializer.input.is_empty() {
        return Err(WireError::TrailingBytes);
    }
    Ok(value)
}

struct Serializer {
    out: Vec<u8>,
}

impl Serializer {
    fn write_len(&mut self, len: usize) -> Result<(), WireError> {
        let len = u32::try_from(len).map_err(|_| WireError::LengthOverflow)?;
        self.out.extend_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

impl<'a> ser::Serializer for &'a mut Serializer {
    type Ok = ();
    type Error = WireError;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = ser::Impossible<(), WireError>;
    type SerializeMap = ser::Impossible<(), WireError>;
    type SerializeStruct = Self;
    type SerializeStructVariant = ser::Impossible<(), WireError>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> Result<(), WireError> {
        self.out.push(u8::from(v));
        Ok(())
    }

    fn serialize_i8(self, v: i8) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_i16(self, v: i16) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_i32(self, v: i32) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_i64(self, v: i64) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<(), WireError> {
        self.out.push(v);
        Ok(())
    }

    fn serialize_u16(self, v: u16) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<(), WireError> {
        self.out.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn serialize_i128(self, _v: i128) -> Result<(), WireError> {
        Err(WireError::Unsupported("i128"))
    }

    fn serialize_u128(self, _v: u128) -> Result<(), WireError> {
        Err(WireError::Unsupported("u128"))
    }

    fn serialize_f32(self, _v: f32) -> Result<(), WireError> {
        Err(WireError::Unsupported("f32"))
    }

    fn serialize_f64(self, _v: f64) -> Result<(), WireError> {
        Err(WireError::Unsupported("f64"))
    }

    fn serialize_char(self, _v: char) -> Result<(), WireError> {
        Err(WireError::Unsupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<(), WireError> {
        self.write_len(v.len())?;
        self.out.extend_from_slice(v.as_bytes());
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), WireError> {
        self.write_len(v.len())?;
        self.out.extend_from_slice(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<(), WireError> {
        self.out.push(0);
        Ok(())
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        self.out.push(1);
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), WireError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), WireError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), WireError> {
        Err(WireError::Unsupported("enum variant"))
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        Err(WireError::Unsupported("enum variant"))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq, WireError> {
        let len = len.ok_or(WireError::Unsupported("sequence of unknown length"))?;
        self.write_len(len)?;
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, WireError> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeTupleStruct, WireError> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, WireError> {
        Err(WireError::Unsupported("enum variant"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, WireError> {
        Err(WireError::Unsupported("map"))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct, WireError> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, WireError> {
        Err(WireError::Unsupported("enum variant"))
    }
}

impl<'a> ser::SerializeSeq for &'a mut Serializer {
    type Ok = ();
    type Error = WireError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WireError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTuple for &'a mut Serializer {
    type Ok = ();
    type Error = WireError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WireError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut Serializer {
    type Ok = ();
    type Error = WireError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WireError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut Serializer {
    type Ok = ();
    type Error = WireError;

    fn serialize_field<T>(&mut self, _key: &'static str, value: &T) -> Result<(), WireError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WireError> {
        Ok(())
    }
}

struct Deserializer<'de> {
    input: &'de [u8],
}

impl<'de> Deserializer<'de> {
    fn take(&mut self, count: usize) -> Result<&'de [u8], WireError> {
        if self.input.len() < count {
            return Err(WireError::Eof);
        }
        let (head, tail) = self.input.split_at(count);
        self.input = tail;
        Ok(head)
    }

    fn take_fixed<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.take(N)?;
        bytes.try_into().map_err(|_| WireError::Eof)
    }

    fn read_len(&mut self) -> Result<usize, WireError> {
        let len = u32::from_be_bytes(self.take_fixed()?);
        usize::try_from(len).map_err(|_| WireError::LengthOverflow)
    }
}

macro_rules! deserialize_int {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V>(self, visitor: V) -> Result<V::Value, WireError>
        where
            V: de::Visitor<'de>,
        {
            visitor.$visit(<$ty>::from_be_bytes(self.take_fixed()?))
        }
    };
}

impl<'de, 'a> de::Deserializer<'de> for &'a mut Deserializer<'de> {
    type Error = WireError;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn deserialize_any<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("self-describing value"))
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        match self.take_fixed::<1>()?[0] {
            0 => visitor.visit_bool(false),
            1 => visitor.visit_bool(true),
            tag => Err(WireError::BadBool(tag)),
        }
    }

    deserialize_int!(deserialize_i8, visit_i8, i8);
    deserialize_int!(deserialize_i16, visit_i16, i16);
    deserialize_int!(deserialize_i32, visit_i32, i32);
    deserialize_int!(deserialize_i64, visit_i64, i64);
    deserialize_int!(deserialize_u8, visit_u8, u8);
    deserialize_int!(deserialize_u16, visit_u16, u16);
    deserialize_int!(deserialize_u32, visit_u32, u32);
    deserialize_int!(deserialize_u64, visit_u64, u64);

    fn deserialize_i128<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("i128"))
    }

    fn deserialize_u128<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("u128"))
    }

    fn deserialize_f32<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("f32"))
    }

    fn deserialize_f64<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("f64"))
    }

    fn deserialize_char<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("char"))
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        visitor.visit_borrowed_str(core::str::from_utf8(bytes).map_err(|_| WireError::BadUtf8)?)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        let len = self.read_len()?;
        visitor.visit_borrowed_bytes(self.take(len)?)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        match self.take_fixed::<1>()?[0] {
            0 => visitor.visit_none(),
            1 => visitor.visit_some(self),
            tag => Err(WireError::BadOption(tag)),
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        let len = self.read_len()?;
        visitor.visit_seq(Counted {
            deserializer: self,
            remaining: len,
        })
    }

    fn deserialize_tuple<V>(self, len: usize, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_seq(Counted {
            deserializer: self,
            remaining: len,
        })
    }

    fn deserialize_tuple_struct<V>(self, _name: &'static str, len: usize, visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_seq(Counted {
            deserializer: self,
            remaining: len,
        })
    }

    fn deserialize_map<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("map"))
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_seq(Counted {
            deserializer: self,
            remaining: fields.len(),
        })
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("enum"))
    }

    fn deserialize_identifier<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("identifier"))
    }

    fn deserialize_ignored_any<V>(self, _visitor: V) -> Result<V::Value, WireError>
    where
        V: de::Visitor<'de>,
    {
        Err(WireError::Unsupported("ignored value"))
    }
}

struct Counted<'a, 'de> {
    deserializer: &'a mut Deserializer<'de>,
    remaining: usize,
}

impl<'a, 'de> de::SeqAccess<'de> for Counted<'a, 'de> {
    type Error = WireError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, WireError>
    where
        T: de::DeserializeSeed<'de>,
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(&mut *self.deserializer).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, string::String, vec, vec::Vec};

    use serde::{Deserialize, Serialize};
    use serde_encoded_bytes::{Hex, SliceLike};

    use super::{from_bytes, to_bytes, WireError};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "SliceLike::<Hex>")]
        blob: Box<[u8]>,
        count: i64,
        flag: bool,
        label: String,
    }

    #[test]
    fn known_byte_layout() {
        let sample = Sample {
            blob: Box::from(*b"\x01\x02"),
            count: -2,
            flag: true,
            label: "ok".into(),
        };
        let bytes = to_bytes(&sample).unwrap();
        let expected = [
            0, 0, 0, 2, 1, 2, // blob: length prefix + contents
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe, // count: big-endian two's complement
            1, // flag
            0, 0, 0, 2, b'o', b'k', // label
        ];
        assert_eq!(bytes.as_ref(), expected);
    }

    #[test]
    fn roundtrip() {
        let sample = Sample {
            blob: Box::from(*b"payload"),
            count: 1234567890123,
            flag: false,
            label: "reason".into(),
        };
        let bytes = to_bytes(&sample).unwrap();
        assert_eq!(from_bytes::<Sample>(&bytes).unwrap(), sample);
    }

    #[test]
    fn sequences_are_count_prefixed() {
        let values = vec![1u32, 2, 3];
        let bytes = to_bytes(&values).unwrap();
        assert_eq!(
            bytes.as_ref(),
            [0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
        assert_eq!(from_bytes::<Vec<u32>>(&bytes).unwrap(), values);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let bytes = to_bytes(&7u32).unwrap();
        let mut extended = bytes.into_vec();
        extended.push(0);
        assert!(matches!(from_bytes::<u32>(&extended), Err(WireError::TrailingBytes)));
    }

    #[test]
    fn truncated_input_rejected() {
        let bytes = to_bytes(&7u64).unwrap();
        assert!(matches!(from_bytes::<u64>(&bytes[..5]), Err(WireError::Eof)));
    }

    #[test]
    fn length_prefix_cannot_overrun() {
        // Claims 16 bytes of content but provides none.
        let bytes = [0, 0, 0, 16];
        assert!(matches!(
            from_bytes::<Sample>(&bytes),
            Err(WireError::Eof)
        ));
    }
}
