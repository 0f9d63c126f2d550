//! DNA binary encoding
//!
//! Literal values and actions are written big-endian with a one byte type tag
//! in front of every value.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

use super::serializer::{read_string, write_string, ObjectStringSerializer};
use super::{DnaAction, LogicalAction, LogicalOperation, PhysicalAction};
use crate::config::DnaConfig;
use crate::error::{Error, Result};
use crate::id::ObjectID;

// Action tags
pub const ACTION_LOGICAL: u8 = 1;
pub const ACTION_PHYSICAL: u8 = 2;
pub const ACTION_ARRAY_ELEMENT: u8 = 3;
pub const ACTION_ENTIRE_ARRAY: u8 = 4;
pub const ACTION_LITERAL: u8 = 5;
pub const ACTION_PHYSICAL_REF: u8 = 6;
pub const ACTION_SUB_ARRAY: u8 = 7;

// Value tags
pub const TYPE_REFERENCE: u8 = 1;
pub const TYPE_BOOLEAN: u8 = 2;
pub const TYPE_BYTE: u8 = 3;
pub const TYPE_CHAR: u8 = 4;
pub const TYPE_DOUBLE: u8 = 5;
pub const TYPE_FLOAT: u8 = 6;
pub const TYPE_INT: u8 = 7;
pub const TYPE_LONG: u8 = 10;
pub const TYPE_SHORT: u8 = 11;
pub const TYPE_STRING: u8 = 12;
pub const TYPE_STRING_BYTES: u8 = 13;
pub const TYPE_ARRAY: u8 = 14;
pub const TYPE_CLASS: u8 = 15;
pub const TYPE_ENUM: u8 = 22;
pub const TYPE_STRING_COMPRESSED: u8 = 25;

const ARRAY_TYPE_PRIMITIVE: u8 = 1;
const ARRAY_TYPE_NON_PRIMITIVE: u8 = 2;

/// Terminates every DNA record
pub const SECTION_END_MARKER: u8 = 0xEE;

/// Deepest accepted nesting of object arrays
pub const MAX_VALUE_DEPTH: usize = 64;

const MAX_LZ4_RATIO: usize = 255;

/// A literal value carried by an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    Short(i16),
    String(String),
    /// Raw UTF-8 bytes, kept undecoded
    StringBytes(Vec<u8>),
    Reference(ObjectID),
    Enum { class_name: String, name: String },
    Class(String),
    PrimitiveArray(PrimitiveArray),
    ObjectArray(Vec<Value>),
}

impl Value {
    /// Reference to an object; the null id is the null value
    pub fn reference(id: ObjectID) -> Self {
        if id.is_null() {
            Value::Null
        } else {
            Value::Reference(id)
        }
    }

    pub fn as_reference(&self) -> Option<ObjectID> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::PrimitiveArray(_) | Value::ObjectArray(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

/// Array of a primitive element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveArray {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Double(Vec<f64>),
    Float(Vec<f32>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Short(Vec<i16>),
}

impl PrimitiveArray {
    pub fn len(&self) -> usize {
        match self {
            PrimitiveArray::Boolean(v) => v.len(),
            PrimitiveArray::Byte(v) => v.len(),
            PrimitiveArray::Char(v) => v.len(),
            PrimitiveArray::Double(v) => v.len(),
            PrimitiveArray::Float(v) => v.len(),
            PrimitiveArray::Int(v) => v.len(),
            PrimitiveArray::Long(v) => v.len(),
            PrimitiveArray::Short(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn element_tag(&self) -> u8 {
        match self {
            PrimitiveArray::Boolean(_) => TYPE_BOOLEAN,
            PrimitiveArray::Byte(_) => TYPE_BYTE,
            PrimitiveArray::Char(_) => TYPE_CHAR,
            PrimitiveArray::Double(_) => TYPE_DOUBLE,
            PrimitiveArray::Float(_) => TYPE_FLOAT,
            PrimitiveArray::Int(_) => TYPE_INT,
            PrimitiveArray::Long(_) => TYPE_LONG,
            PrimitiveArray::Short(_) => TYPE_SHORT,
        }
    }
}

/// Bounds-checked big-endian reader over a byte slice
#[derive(Debug, Clone)]
pub struct Input<'a> {
    buf: &'a [u8],
    start_len: usize,
}

fn truncated(e: std::io::Error) -> Error {
    Error::decode(format!("truncated input: {}", e))
}

impl<'a> Input<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            start_len: buf.len(),
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.start_len - self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.buf.read_u8().map_err(truncated)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.buf.read_i8().map_err(truncated)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.buf.read_i16::<BigEndian>().map_err(truncated)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.buf.read_u16::<BigEndian>().map_err(truncated)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.buf.read_i32::<BigEndian>().map_err(truncated)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.buf.read_i64::<BigEndian>().map_err(truncated)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.buf.read_f32::<BigEndian>().map_err(truncated)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.buf.read_f64::<BigEndian>().map_err(truncated)
    }

    /// Read a non-negative i32 length
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| Error::decode(format!("negative length {}", len)))
    }

    /// Read an i32 length where -1 means null
    pub fn read_nullable_len(&mut self) -> Result<Option<usize>> {
        match self.read_i32()? {
            -1 => Ok(None),
            len => usize::try_from(len)
                .map(Some)
                .map_err(|_| Error::decode(format!("negative length {}", len))),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.buf.len() {
            return Err(Error::decode(format!(
                "truncated input: need {} bytes, have {}",
                len,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

/// Value and action encoder
#[derive(Debug, Clone, Copy)]
pub struct DnaEncoding {
    compress_strings: bool,
    compress_min_size: usize,
}

impl Default for DnaEncoding {
    fn default() -> Self {
        Self::from_config(&DnaConfig::default())
    }
}

impl DnaEncoding {
    pub fn from_config(config: &DnaConfig) -> Self {
        Self {
            compress_strings: config.string_compression,
            compress_min_size: config.string_compress_min_size,
        }
    }

    /// Encoding that never compresses strings
    pub fn uncompressed() -> Self {
        Self {
            compress_strings: false,
            compress_min_size: usize::MAX,
        }
    }

    pub fn encode_value(
        &self,
        value: &Value,
        out: &mut Vec<u8>,
        serializer: &mut dyn ObjectStringSerializer,
    ) {
        match value {
            Value::Null => {
                out.put_u8(TYPE_REFERENCE);
                out.put_i64(ObjectID::NULL_ID.as_i64());
            }
            Value::Reference(id) => {
                out.put_u8(TYPE_REFERENCE);
                out.put_i64(id.as_i64());
            }
            Value::Boolean(v) => {
                out.put_u8(TYPE_BOOLEAN);
                out.put_u8(*v as u8);
            }
            Value::Byte(v) => {
                out.put_u8(TYPE_BYTE);
                out.put_i8(*v);
            }
            Value::Char(v) => {
                out.put_u8(TYPE_CHAR);
                out.put_u16(*v);
            }
            Value::Double(v) => {
                out.put_u8(TYPE_DOUBLE);
                out.put_f64(*v);
            }
            Value::Float(v) => {
                out.put_u8(TYPE_FLOAT);
                out.put_f32(*v);
            }
            Value::Int(v) => {
                out.put_u8(TYPE_INT);
                out.put_i32(*v);
            }
            Value::Long(v) => {
                out.put_u8(TYPE_LONG);
                out.put_i64(*v);
            }
            Value::Short(v) => {
                out.put_u8(TYPE_SHORT);
                out.put_i16(*v);
            }
            Value::String(s) => {
                if self.compress_strings && s.len() >= self.compress_min_size {
                    out.put_u8(TYPE_STRING_COMPRESSED);
                    write_compressed(s.as_bytes(), out);
                } else {
                    out.put_u8(TYPE_STRING);
                    write_string(serializer, out, s);
                }
            }
            Value::StringBytes(bytes) => {
                out.put_u8(TYPE_STRING_BYTES);
                serializer.write_string_bytes(out, bytes);
            }
            Value::Enum { class_name, name } => {
                out.put_u8(TYPE_ENUM);
                write_string(serializer, out, class_name);
                write_string(serializer, out, name);
            }
            Value::Class(name) => {
                out.put_u8(TYPE_CLASS);
                write_string(serializer, out, name);
            }
            Value::PrimitiveArray(array) => {
                out.put_u8(TYPE_ARRAY);
                out.put_i32(array.len() as i32);
                out.put_u8(ARRAY_TYPE_PRIMITIVE);
                out.put_u8(array.element_tag());
                encode_primitive_elements(array, out);
            }
            Value::ObjectArray(values) => {
                out.put_u8(TYPE_ARRAY);
                out.put_i32(values.len() as i32);
                out.put_u8(ARRAY_TYPE_NON_PRIMITIVE);
                for v in values {
                    self.encode_value(v, out, serializer);
                }
            }
        }
    }

    pub fn encode_action(
        &self,
        action: &DnaAction,
        out: &mut Vec<u8>,
        serializer: &mut dyn ObjectStringSerializer,
    ) {
        match action {
            DnaAction::Logical(logical) => {
                out.put_u8(ACTION_LOGICAL);
                out.put_i32(logical.operation.code());
                out.put_i32(logical.parameters.len() as i32);
                for p in &logical.parameters {
                    self.encode_value(p, out, serializer);
                }
            }
            DnaAction::Physical(PhysicalAction::TruePhysical {
                field,
                value,
                is_reference,
            }) => {
                out.put_u8(if *is_reference {
                    ACTION_PHYSICAL_REF
                } else {
                    ACTION_PHYSICAL
                });
                write_string(serializer, out, field);
                self.encode_value(value, out, serializer);
            }
            DnaAction::Physical(PhysicalAction::ArrayElement {
                index,
                value,
                is_reference,
            }) => {
                out.put_u8(ACTION_ARRAY_ELEMENT);
                out.put_i32(*index);
                out.put_u8(*is_reference as u8);
                self.encode_value(value, out, serializer);
            }
            DnaAction::Physical(PhysicalAction::EntireArray { value }) => {
                out.put_u8(ACTION_ENTIRE_ARRAY);
                self.encode_value(value, out, serializer);
            }
            DnaAction::Physical(PhysicalAction::SubArray {
                start_index,
                value,
                length,
            }) => {
                out.put_u8(ACTION_SUB_ARRAY);
                out.put_i32(*start_index);
                out.put_i32(*length);
                self.encode_value(value, out, serializer);
            }
            DnaAction::Literal(value) => {
                out.put_u8(ACTION_LITERAL);
                self.encode_value(value, out, serializer);
            }
        }
    }
}

fn write_compressed(bytes: &[u8], out: &mut Vec<u8>) {
    let compressed = lz4_flex::block::compress(bytes);
    out.put_i32(bytes.len() as i32);
    out.put_i32(compressed.len() as i32);
    out.put_slice(&compressed);
}

fn read_compressed(input: &mut Input<'_>) -> Result<String> {
    let uncompressed_len = input.read_len()?;
    let compressed_len = input.read_len()?;
    // An lz4 block expands at most ~255x
    if uncompressed_len > compressed_len.saturating_mul(MAX_LZ4_RATIO) + 16 {
        return Err(Error::decode(format!(
            "compressed string claims {} bytes from {} compressed",
            uncompressed_len, compressed_len
        )));
    }
    let compressed = input.read_bytes(compressed_len)?;
    let bytes = lz4_flex::block::decompress(compressed, uncompressed_len)
        .map_err(|e| Error::decode(format!("corrupt compressed string: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::decode(format!("invalid UTF-8 string: {}", e)))
}

fn encode_primitive_elements(array: &PrimitiveArray, out: &mut Vec<u8>) {
    match array {
        PrimitiveArray::Boolean(v) => v.iter().for_each(|x| out.put_u8(*x as u8)),
        PrimitiveArray::Byte(v) => v.iter().for_each(|x| out.put_i8(*x)),
        PrimitiveArray::Char(v) => v.iter().for_each(|x| out.put_u16(*x)),
        PrimitiveArray::Double(v) => v.iter().for_each(|x| out.put_f64(*x)),
        PrimitiveArray::Float(v) => v.iter().for_each(|x| out.put_f32(*x)),
        PrimitiveArray::Int(v) => v.iter().for_each(|x| out.put_i32(*x)),
        PrimitiveArray::Long(v) => v.iter().for_each(|x| out.put_i64(*x)),
        PrimitiveArray::Short(v) => v.iter().for_each(|x| out.put_i16(*x)),
    }
}

fn decode_primitive_elements(tag: u8, len: usize, input: &mut Input<'_>) -> Result<PrimitiveArray> {
    // Each element is at least one byte; refuse lengths the input cannot hold
    if len > input.remaining() {
        return Err(Error::decode(format!(
            "array length {} exceeds remaining input {}",
            len,
            input.remaining()
        )));
    }
    let array = match tag {
        TYPE_BOOLEAN => PrimitiveArray::Boolean(
            (0..len).map(|_| input.read_bool()).collect::<Result<_>>()?,
        ),
        TYPE_BYTE => PrimitiveArray::Byte((0..len).map(|_| input.read_i8()).collect::<Result<_>>()?),
        TYPE_CHAR => PrimitiveArray::Char((0..len).map(|_| input.read_u16()).collect::<Result<_>>()?),
        TYPE_DOUBLE => {
            PrimitiveArray::Double((0..len).map(|_| input.read_f64()).collect::<Result<_>>()?)
        }
        TYPE_FLOAT => PrimitiveArray::Float((0..len).map(|_| input.read_f32()).collect::<Result<_>>()?),
        TYPE_INT => PrimitiveArray::Int((0..len).map(|_| input.read_i32()).collect::<Result<_>>()?),
        TYPE_LONG => PrimitiveArray::Long((0..len).map(|_| input.read_i64()).collect::<Result<_>>()?),
        TYPE_SHORT => PrimitiveArray::Short((0..len).map(|_| input.read_i16()).collect::<Result<_>>()?),
        other => {
            return Err(Error::decode(format!(
                "unknown primitive array element type {}",
                other
            )))
        }
    };
    Ok(array)
}

/// Decode one tagged value
pub fn decode_value(input: &mut Input<'_>, serializer: &dyn ObjectStringSerializer) -> Result<Value> {
    decode_nested_value(input, serializer, 0)
}

fn decode_nested_value(
    input: &mut Input<'_>,
    serializer: &dyn ObjectStringSerializer,
    depth: usize,
) -> Result<Value> {
    if depth > MAX_VALUE_DEPTH {
        return Err(Error::decode(format!(
            "object arrays nested deeper than {}",
            MAX_VALUE_DEPTH
        )));
    }
    let tag = input.read_u8()?;
    let value = match tag {
        TYPE_REFERENCE => Value::reference(ObjectID(input.read_i64()?)),
        TYPE_BOOLEAN => Value::Boolean(input.read_bool()?),
        TYPE_BYTE => Value::Byte(input.read_i8()?),
        TYPE_CHAR => Value::Char(input.read_u16()?),
        TYPE_DOUBLE => Value::Double(input.read_f64()?),
        TYPE_FLOAT => Value::Float(input.read_f32()?),
        TYPE_INT => Value::Int(input.read_i32()?),
        TYPE_LONG => Value::Long(input.read_i64()?),
        TYPE_SHORT => Value::Short(input.read_i16()?),
        TYPE_STRING => Value::String(read_string(serializer, input)?),
        TYPE_STRING_BYTES => Value::StringBytes(serializer.read_string_bytes(input)?),
        TYPE_STRING_COMPRESSED => Value::String(read_compressed(input)?),
        TYPE_ENUM => Value::Enum {
            class_name: read_string(serializer, input)?,
            name: read_string(serializer, input)?,
        },
        TYPE_CLASS => Value::Class(read_string(serializer, input)?),
        TYPE_ARRAY => match input.read_nullable_len()? {
            None => Value::Null,
            Some(len) => match input.read_u8()? {
                ARRAY_TYPE_PRIMITIVE => {
                    let element = input.read_u8()?;
                    Value::PrimitiveArray(decode_primitive_elements(element, len, input)?)
                }
                ARRAY_TYPE_NON_PRIMITIVE => {
                    if len > input.remaining() {
                        return Err(Error::decode(format!(
                            "array length {} exceeds remaining input {}",
                            len,
                            input.remaining()
                        )));
                    }
                    let mut values = Vec::with_capacity(len);
                    for _ in 0..len {
                        values.push(decode_nested_value(input, serializer, depth + 1)?);
                    }
                    Value::ObjectArray(values)
                }
                other => return Err(Error::decode(format!("unknown array type {}", other))),
            },
        },
        other => return Err(Error::decode(format!("unknown value type {}", other))),
    };
    Ok(value)
}

/// Decode one tagged action
pub fn decode_action(input: &mut Input<'_>, serializer: &dyn ObjectStringSerializer) -> Result<DnaAction> {
    let tag = input.read_u8()?;
    let action = match tag {
        ACTION_LOGICAL => {
            let operation = LogicalOperation::from_code(input.read_i32()?)?;
            let count = input.read_len()?;
            let mut parameters = Vec::with_capacity(count.min(input.remaining()));
            for _ in 0..count {
                parameters.push(decode_value(input, serializer)?);
            }
            DnaAction::Logical(LogicalAction {
                operation,
                parameters,
            })
        }
        ACTION_PHYSICAL | ACTION_PHYSICAL_REF => {
            let field = read_string(serializer, input)?;
            let value = decode_value(input, serializer)?;
            DnaAction::Physical(PhysicalAction::TruePhysical {
                field,
                value,
                is_reference: tag == ACTION_PHYSICAL_REF,
            })
        }
        ACTION_ARRAY_ELEMENT => {
            let index = input.read_i32()?;
            let is_reference = input.read_bool()?;
            let value = decode_value(input, serializer)?;
            DnaAction::Physical(PhysicalAction::ArrayElement {
                index,
                value,
                is_reference,
            })
        }
        ACTION_ENTIRE_ARRAY => DnaAction::Physical(PhysicalAction::EntireArray {
            value: decode_value(input, serializer)?,
        }),
        ACTION_SUB_ARRAY => {
            let start_index = input.read_i32()?;
            let length = input.read_i32()?;
            let value = decode_value(input, serializer)?;
            DnaAction::Physical(PhysicalAction::SubArray {
                start_index,
                value,
                length,
            })
        }
        ACTION_LITERAL => DnaAction::Literal(decode_value(input, serializer)?),
        other => return Err(Error::decode(format!("unknown action type {}", other))),
    };
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::serializer::NullObjectStringSerializer;

    fn roundtrip(encoding: &DnaEncoding, value: &Value) -> Value {
        let mut ser = NullObjectStringSerializer;
        let mut out = Vec::new();
        encoding.encode_value(value, &mut out, &mut ser);
        let mut input = Input::new(&out);
        let decoded = decode_value(&mut input, &ser).unwrap();
        assert_eq!(input.remaining(), 0);
        decoded
    }

    #[test]
    fn test_value_encoding() {
        let encoding = DnaEncoding::default();
        let values = vec![
            Value::Null,
            Value::Char(0x263A),
            Value::Double(-2.5),
            Value::Enum {
                class_name: "com.acme.Color".into(),
                name: "RED".into(),
            },
            Value::PrimitiveArray(PrimitiveArray::Long(vec![1, -1, i64::MAX])),
            Value::ObjectArray(vec![Value::reference(ObjectID(9)), Value::Null, "x".into()]),
        ];
        for v in &values {
            assert_eq!(&roundtrip(&encoding, v), v);
        }
    }

    #[test]
    fn test_long_strings_are_compressed() {
        let config = DnaConfig {
            string_compression: true,
            string_compress_min_size: 64,
            intern_strings: false,
        };
        let encoding = DnaEncoding::from_config(&config);
        let text = "abcdefgh".repeat(100);

        let mut ser = NullObjectStringSerializer;
        let mut out = Vec::new();
        encoding.encode_value(&Value::String(text.clone()), &mut out, &mut ser);
        assert_eq!(out[0], TYPE_STRING_COMPRESSED);
        assert!(out.len() < text.len());

        assert_eq!(roundtrip(&encoding, &Value::String(text.clone())), Value::String(text));
    }

    #[test]
    fn test_null_reference_and_null_array_decode_as_null() {
        let mut out = Vec::new();
        out.put_u8(TYPE_ARRAY);
        out.put_i32(-1);
        let ser = NullObjectStringSerializer;
        assert_eq!(decode_value(&mut Input::new(&out), &ser).unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_tags_are_decode_errors() {
        let ser = NullObjectStringSerializer;
        assert!(matches!(
            decode_value(&mut Input::new(&[99]), &ser),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode_action(&mut Input::new(&[42]), &ser),
            Err(Error::Decode(_))
        ));

        let mut out = vec![ACTION_LOGICAL];
        out.put_i32(9999);
        out.put_i32(0);
        assert!(matches!(
            decode_action(&mut Input::new(&out), &ser),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_input() {
        let ser = NullObjectStringSerializer;
        let out = vec![TYPE_LONG, 0, 0];
        assert!(matches!(
            decode_value(&mut Input::new(&out), &ser),
            Err(Error::Decode(_))
        ));
    }

    fn nested_arrays(levels: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(levels * 6 + 9);
        for _ in 0..levels {
            out.put_u8(TYPE_ARRAY);
            out.put_i32(1);
            out.put_u8(ARRAY_TYPE_NON_PRIMITIVE);
        }
        out.put_u8(TYPE_LONG);
        out.put_i64(5);
        out
    }

    #[test]
    fn test_deeply_nested_arrays_are_rejected() {
        let ser = NullObjectStringSerializer;

        let shallow = nested_arrays(MAX_VALUE_DEPTH);
        assert!(decode_value(&mut Input::new(&shallow), &ser).is_ok());

        let deep = nested_arrays(200_000);
        assert!(matches!(
            decode_value(&mut Input::new(&deep), &ser),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_decompressed_length_is_rejected() {
        let ser = NullObjectStringSerializer;
        let mut out = Vec::new();
        out.put_u8(TYPE_STRING_COMPRESSED);
        out.put_i32(i32::MAX);
        out.put_i32(4);
        out.put_slice(&[0x40, b'a', b'b', b'c']);

        assert!(matches!(
            decode_value(&mut Input::new(&out), &ser),
            Err(Error::Decode(_))
        ));
    }
}
