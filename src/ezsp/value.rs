//! The schema-driven parameter codec shared by every EZSP protocol version.
//!
//! Command tables describe each request and response as an ordered list of
//! named fields; this module knows how to put those fields on the wire.
//! Everything is little-endian except where a kind says otherwise.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{Error, Result};

/// Fields decoded so far, passed to `requires` predicates on optional
/// trailing fields.
pub type Partial = [(&'static str, Value)];

pub type RequiresFn = fn(&Partial) -> bool;

/// The wire shape of a single parameter.
#[derive(Debug, Clone, Copy)]
pub enum ParameterKind {
    /// Unsigned little-endian integer of the given byte width (1..=8).
    Uint(usize),
    /// Signed little-endian integer of the given byte width (1..=8).
    Int(usize),
    /// Single byte, zero or one.
    Bool,
    /// Bit flags carried as an unsigned integer of the given width.
    Bitmap(usize),
    /// Tagged enumeration carried as an unsigned integer of the given width.
    Enum(usize),
    /// Byte string preceded by its length (width 1 or 4 bytes).
    Bytes { length_width: usize },
    /// Fixed number of elements, no length prefix.
    FixedArray {
        kind: &'static ParameterKind,
        len: usize,
    },
    /// Variable-length list preceded by a one-byte element count.
    List { kind: &'static ParameterKind },
    /// Nested structure.
    Struct(&'static Schema),
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: ParameterKind,
    /// When present, the field only appears on the wire if the predicate
    /// holds over the fields before it.
    pub requires: Option<RequiresFn>,
}

impl Field {
    pub const fn new(name: &'static str, kind: ParameterKind) -> Field {
        Field {
            name,
            kind,
            requires: None,
        }
    }

    pub const fn conditional(name: &'static str, kind: ParameterKind, requires: RequiresFn) -> Field {
        Field {
            name,
            kind,
            requires: Some(requires),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub fields: &'static [Field],
}

impl Schema {
    pub const EMPTY: Schema = Schema { fields: &[] };

    pub const fn new(fields: &'static [Field]) -> Schema {
        Schema { fields }
    }
}

/// A dynamically-typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Bool(bool),
    Bytes(Bytes),
    List(Vec<Value>),
    Struct(Vec<(&'static str, Value)>),
}

impl Value {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }
}

fn check_width(width: usize) -> Result<()> {
    if (1..=8).contains(&width) {
        Ok(())
    } else {
        Err(Error::Encode("integer width out of range"))
    }
}

/// Encode one value of the given kind onto `buf`.
pub fn encode(kind: &ParameterKind, value: &Value, buf: &mut BytesMut) -> Result<()> {
    match (kind, value) {
        (ParameterKind::Uint(w) | ParameterKind::Bitmap(w) | ParameterKind::Enum(w), Value::Uint(v)) => {
            check_width(*w)?;
            buf.put_uint_le(*v, *w);
            Ok(())
        }
        (ParameterKind::Int(w), Value::Int(v)) => {
            check_width(*w)?;
            buf.put_int_le(*v, *w);
            Ok(())
        }
        (ParameterKind::Bool, Value::Bool(v)) => {
            buf.put_u8(*v as u8);
            Ok(())
        }
        (ParameterKind::Bytes { length_width }, Value::Bytes(v)) => {
            match length_width {
                1 => {
                    let len: u8 = v
                        .len()
                        .try_into()
                        .map_err(|_| Error::Encode("byte string too long"))?;
                    buf.put_u8(len);
                }
                4 => buf.put_u32_le(v.len() as u32),
                _ => return Err(Error::Encode("unsupported length prefix width")),
            }
            buf.put_slice(v);
            Ok(())
        }
        (ParameterKind::FixedArray { kind, len }, Value::List(items)) => {
            if items.len() != *len {
                return Err(Error::Encode("fixed array length mismatch"));
            }
            for item in items {
                encode(kind, item, buf)?;
            }
            Ok(())
        }
        (ParameterKind::List { kind }, Value::List(items)) => {
            let count: u8 = items
                .len()
                .try_into()
                .map_err(|_| Error::Encode("list too long"))?;
            buf.put_u8(count);
            for item in items {
                encode(kind, item, buf)?;
            }
            Ok(())
        }
        (ParameterKind::Struct(schema), Value::Struct(fields)) => {
            encode_schema(schema, fields, buf)
        }
        _ => Err(Error::Encode("value does not match parameter kind")),
    }
}

/// Encode a named field set against a schema, honoring `requires` guards.
pub fn encode_schema(schema: &Schema, values: &Partial, buf: &mut BytesMut) -> Result<()> {
    let mut written: Vec<(&'static str, Value)> = Vec::with_capacity(schema.fields.len());
    for field in schema.fields {
        if let Some(requires) = field.requires {
            if !requires(&written) {
                continue;
            }
        }
        let value = values
            .iter()
            .find(|(name, _)| *name == field.name)
            .map(|(_, value)| value)
            .ok_or(Error::Encode("missing field"))?;
        encode(&field.kind, value, buf)?;
        written.push((field.name, value.clone()));
    }
    Ok(())
}

fn take_checked(buf: &mut impl Buf, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(Error::Decode("unexpected end of frame"));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Decode one value of the given kind from `buf`.
pub fn decode(kind: &ParameterKind, buf: &mut impl Buf) -> Result<Value> {
    match kind {
        ParameterKind::Uint(w) | ParameterKind::Bitmap(w) | ParameterKind::Enum(w) => {
            if buf.remaining() < *w {
                return Err(Error::Decode("unexpected end of frame"));
            }
            Ok(Value::Uint(buf.get_uint_le(*w)))
        }
        ParameterKind::Int(w) => {
            if buf.remaining() < *w {
                return Err(Error::Decode("unexpected end of frame"));
            }
            Ok(Value::Int(buf.get_int_le(*w)))
        }
        ParameterKind::Bool => {
            if !buf.has_remaining() {
                return Err(Error::Decode("unexpected end of frame"));
            }
            Ok(Value::Bool(buf.get_u8() != 0))
        }
        ParameterKind::Bytes { length_width } => {
            let len = match length_width {
                1 => {
                    if !buf.has_remaining() {
                        return Err(Error::Decode("unexpected end of frame"));
                    }
                    buf.get_u8() as usize
                }
                4 => {
                    if buf.remaining() < 4 {
                        return Err(Error::Decode("unexpected end of frame"));
                    }
                    buf.get_u32_le() as usize
                }
                _ => return Err(Error::Decode("unsupported length prefix width")),
            };
            Ok(Value::Bytes(take_checked(buf, len)?))
        }
        ParameterKind::FixedArray { kind, len } => {
            let mut items = Vec::with_capacity(*len);
            for _ in 0..*len {
                items.push(decode(kind, buf)?);
            }
            Ok(Value::List(items))
        }
        ParameterKind::List { kind } => {
            if !buf.has_remaining() {
                return Err(Error::Decode("unexpected end of frame"));
            }
            let count = buf.get_u8() as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode(kind, buf)?);
            }
            Ok(Value::List(items))
        }
        ParameterKind::Struct(schema) => {
            Ok(Value::Struct(decode_schema(schema, buf)?))
        }
    }
}

/// Decode a full schema, honoring `requires` guards on trailing fields.
pub fn decode_schema(
    schema: &Schema,
    buf: &mut impl Buf,
) -> Result<Vec<(&'static str, Value)>> {
    let mut fields: Vec<(&'static str, Value)> = Vec::with_capacity(schema.fields.len());
    for field in schema.fields {
        if let Some(requires) = field.requires {
            if !requires(&fields) {
                continue;
            }
        }
        let value = decode(&field.kind, buf)?;
        fields.push((field.name, value));
    }
    Ok(fields)
}
