//! Tag-level encoding.
//!
//! Each item starts with a tag byte: the low 3 bits name the value type,
//! the high 5 bits carry the tag number. Tag numbers of 31 and above set
//! all five bits and continue in a 7-bit varint. Numeric values use the
//! same varint; strings and byte arrays carry a varint length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Reserved header tag numbers.
pub mod header {
    /// Terminator within a sub-structure.
    pub const END: u32 = 0;
    /// The service a message targets.
    pub const SERVICE_ID: u32 = 1;
    /// The message within the service.
    pub const MESSAGE_ID: u32 = 2;
    /// Total body bytes of a chunked transfer (first chunk only).
    pub const SEQUENCE_START: u32 = 3;
    /// Marks the final chunk of a chunked transfer.
    pub const LAST_IN_SEQUENCE: u32 = 4;
    /// Keepalive.
    pub const PING: u32 = 5;
    /// Keepalive reply.
    pub const PONG: u32 = 6;
    /// End of header; body follows.
    pub const HEADER_END: u32 = 7;
}

/// The value-type bits of a tag byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TagType {
    PositiveNumber = 0,
    NegativeNumber = 1,
    String = 2,
    ByteArray = 3,
    BoolTrue = 4,
    BoolFalse = 5,
    Double = 6,
}

impl TagType {
    fn from_bits(bits: u8) -> Result<TagType, Error> {
        Ok(match bits {
            0 => TagType::PositiveNumber,
            1 => TagType::NegativeNumber,
            2 => TagType::String,
            3 => TagType::ByteArray,
            4 => TagType::BoolTrue,
            5 => TagType::BoolFalse,
            6 => TagType::Double,
            _ => return Err(Error::Parse("unknown tag type")),
        })
    }
}

/// A decoded tag-value item.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    PositiveInt(u64),
    NegativeInt(u64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Double(f64),
}

impl TagValue {
    fn tag_type(&self) -> TagType {
        match self {
            TagValue::PositiveInt(_) => TagType::PositiveNumber,
            TagValue::NegativeInt(_) => TagType::NegativeNumber,
            TagValue::Str(_) => TagType::String,
            TagValue::Bytes(_) => TagType::ByteArray,
            TagValue::Bool(true) => TagType::BoolTrue,
            TagValue::Bool(false) => TagType::BoolFalse,
            TagValue::Double(_) => TagType::Double,
        }
    }

    /// The numeric value, for items known to be numbers.
    pub fn as_int(&self) -> Option<u64> {
        match self {
            TagValue::PositiveInt(value) => Some(*value),
            _ => None,
        }
    }
}

/// Write a 7-bit varint: little groups first, high bit marks continuation.
fn put_varint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

fn get_varint(src: &mut Bytes) -> Result<u64, Error> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !src.has_remaining() {
            return Err(Error::Parse("varint truncated"));
        }
        let byte = src.get_u8();
        if shift >= 64 {
            return Err(Error::Parse("varint too wide"));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Append one item to a buffer.
pub fn put_item(dst: &mut BytesMut, tag: u32, value: &TagValue) {
    let type_bits = value.tag_type() as u8;
    if tag < 31 {
        dst.put_u8(((tag as u8) << 3) | type_bits);
    } else {
        dst.put_u8((31u8 << 3) | type_bits);
        put_varint(dst, (tag - 31) as u64);
    }
    match value {
        TagValue::PositiveInt(value) | TagValue::NegativeInt(value) => put_varint(dst, *value),
        TagValue::Str(text) => {
            put_varint(dst, text.len() as u64);
            dst.put_slice(text.as_bytes());
        }
        TagValue::Bytes(bytes) => {
            put_varint(dst, bytes.len() as u64);
            dst.put_slice(bytes);
        }
        TagValue::Bool(_) => {}
        TagValue::Double(value) => dst.put_slice(&value.to_le_bytes()),
    }
}

/// Read one item from the front of `src`.
pub fn get_item(src: &mut Bytes) -> Result<(u32, TagValue), Error> {
    if !src.has_remaining() {
        return Err(Error::Parse("item truncated"));
    }
    let first = src.get_u8();
    let tag_type = TagType::from_bits(first & 0x07)?;
    let mut tag = (first >> 3) as u32;
    if tag == 31 {
        tag = 31 + get_varint(src)? as u32;
    }

    let value = match tag_type {
        TagType::PositiveNumber => TagValue::PositiveInt(get_varint(src)?),
        TagType::NegativeNumber => TagValue::NegativeInt(get_varint(src)?),
        TagType::String => {
            let len = get_varint(src)? as usize;
            if src.remaining() < len {
                return Err(Error::Parse("string truncated"));
            }
            let bytes = src.split_to(len);
            TagValue::Str(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| Error::Parse("string is not utf-8"))?,
            )
        }
        TagType::ByteArray => {
            let len = get_varint(src)? as usize;
            if src.remaining() < len {
                return Err(Error::Parse("byte array truncated"));
            }
            TagValue::Bytes(src.split_to(len).to_vec())
        }
        TagType::BoolTrue => TagValue::Bool(true),
        TagType::BoolFalse => TagValue::Bool(false),
        TagType::Double => {
            if src.remaining() < 8 {
                return Err(Error::Parse("double truncated"));
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&src.split_to(8));
            TagValue::Double(f64::from_le_bytes(bytes))
        }
    };
    Ok((tag, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tag: u32, value: TagValue) {
        let mut buf = BytesMut::new();
        put_item(&mut buf, tag, &value);
        let mut bytes = buf.freeze();
        let (parsed_tag, parsed_value) = get_item(&mut bytes).unwrap();
        assert_eq!(parsed_tag, tag);
        assert_eq!(parsed_value, value);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn items_round_trip() {
        quagga_test::init();

        roundtrip(header::SERVICE_ID, TagValue::PositiveInt(8));
        roundtrip(3, TagValue::NegativeInt(12_345));
        roundtrip(12, TagValue::Str("bitcoincash".to_string()));
        roundtrip(30, TagValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
        roundtrip(5, TagValue::Bool(true));
        roundtrip(6, TagValue::Bool(false));
        roundtrip(7, TagValue::Double(1.5));

        // Tag numbers at and beyond the 5-bit boundary.
        roundtrip(31, TagValue::PositiveInt(1));
        roundtrip(32, TagValue::PositiveInt(1));
        roundtrip(1000, TagValue::Bool(true));
    }

    #[test]
    fn service_id_item_is_the_protocol_sniff() {
        quagga_test::init();

        // The first item of a first frame: positive-int service-id, whose
        // tag byte is 0x08.
        let mut buf = BytesMut::new();
        put_item(&mut buf, header::SERVICE_ID, &TagValue::PositiveInt(0));
        assert_eq!(buf[0], 0x08);
    }

    #[test]
    fn truncated_items_error() {
        quagga_test::init();

        let mut bytes = Bytes::from(vec![0x1a, 0x05, b'h', b'i']);
        assert!(get_item(&mut bytes).is_err());
    }
}
