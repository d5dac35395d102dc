use thiserror::Error;

/// Protobuf wire types understood by the codec.
///
/// Anything else stops the parse early; whatever was accumulated so far is
/// returned and the caller decides whether that is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    I64 = 1,
    Len = 2,
    I32 = 5,
}

impl WireType {
    pub fn from_tag(tag: u64) -> Option<WireType> {
        match tag & 0x07 {
            0 => Some(WireType::Varint),
            1 => Some(WireType::I64),
            2 => Some(WireType::Len),
            5 => Some(WireType::I32),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("varint exceeds 10 bytes")]
    VarintOverflow,
    #[error("truncated input")]
    Truncated,
}

const MAX_VARINT_BYTES: usize = 10;

/// Read a LEB128 varint at `*pos`, advancing it. Rejects encodings longer
/// than 10 bytes.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, ProtoError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut read = 0usize;
    loop {
        if read >= MAX_VARINT_BYTES {
            return Err(ProtoError::VarintOverflow);
        }
        let Some(&byte) = buf.get(*pos + read) else {
            return Err(ProtoError::Truncated);
        };
        read += 1;
        if shift < 64 {
            value |= u64::from(byte & 0x7f) << shift;
        }
        if byte & 0x80 == 0 {
            *pos += read;
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// A decoded value, borrowed from the input buffer where possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// One field as it sits on the wire.
///
/// `raw` is the untouched tag+value span; re-emitting `raw` for every field
/// the splicer does not target is what keeps the replayed request byte-equal
/// to the original outside the targeted fields.
#[derive(Debug, Clone, Copy)]
pub struct RawField<'a> {
    pub number: u32,
    pub wire_type: WireType,
    pub raw: &'a [u8],
    /// For `Len` fields the content bytes; for scalar fields the value span.
    pub payload: &'a [u8],
}

/// Decode every field the codec understands, stopping early (without error)
/// at the first unknown wire type or malformed span.
///
/// Returns the fields plus the number of bytes consumed; callers that need
/// byte-exact re-serialisation must check `consumed == buf.len()`.
pub fn decode_raw_fields_checked(buf: &[u8]) -> (Vec<RawField<'_>>, usize) {
    let mut fields = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let start = pos;
        let Ok(tag) = read_varint(buf, &mut pos) else {
            return (fields, start);
        };
        let number = (tag >> 3) as u32;
        if number == 0 {
            return (fields, start);
        }
        let Some(wire_type) = WireType::from_tag(tag) else {
            return (fields, start);
        };
        let payload_start = pos;
        let payload_end = match wire_type {
            WireType::Varint => {
                let Ok(_) = read_varint(buf, &mut pos) else {
                    return (fields, start);
                };
                pos
            }
            WireType::I64 => {
                if pos + 8 > buf.len() {
                    return (fields, start);
                }
                pos += 8;
                pos
            }
            WireType::I32 => {
                if pos + 4 > buf.len() {
                    return (fields, start);
                }
                pos += 4;
                pos
            }
            WireType::Len => {
                let Ok(len) = read_varint(buf, &mut pos) else {
                    return (fields, start);
                };
                let Some(end) = pos.checked_add(len as usize) else {
                    return (fields, start);
                };
                if end > buf.len() {
                    return (fields, start);
                }
                let content_start = pos;
                pos = end;
                fields.push(RawField {
                    number,
                    wire_type,
                    raw: &buf[start..end],
                    payload: &buf[content_start..end],
                });
                continue;
            }
        };
        fields.push(RawField {
            number,
            wire_type,
            raw: &buf[start..pos],
            payload: &buf[payload_start..payload_end],
        });
    }
    (fields, pos)
}

/// Convenience wrapper when partial parses are acceptable.
pub fn decode_raw_fields(buf: &[u8]) -> Vec<RawField<'_>> {
    decode_raw_fields_checked(buf).0
}

/// Ordered multimap decode, for reading only.
pub fn decode_field_map(buf: &[u8]) -> Vec<(u32, FieldValue<'_>)> {
    decode_raw_fields(buf)
        .into_iter()
        .filter_map(|field| {
            let value = match field.wire_type {
                WireType::Varint => {
                    let mut pos = 0;
                    FieldValue::Varint(read_varint(field.payload, &mut pos).ok()?)
                }
                WireType::I64 => FieldValue::Fixed64(u64::from_le_bytes(
                    field.payload.try_into().ok()?,
                )),
                WireType::I32 => FieldValue::Fixed32(u32::from_le_bytes(
                    field.payload.try_into().ok()?,
                )),
                WireType::Len => FieldValue::Bytes(field.payload),
            };
            Some((field.number, value))
        })
        .collect()
}

/// Minimal protobuf writer. Tags are `(number << 3) | wire_type`; LEN values
/// get a varint length prefix.
#[derive(Debug, Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, number: u32, wire_type: WireType) {
        write_varint(&mut self.buf, (u64::from(number) << 3) | wire_type as u64);
    }

    pub fn varint(&mut self, number: u32, value: u64) -> &mut Self {
        self.tag(number, WireType::Varint);
        write_varint(&mut self.buf, value);
        self
    }

    pub fn bytes(&mut self, number: u32, value: &[u8]) -> &mut Self {
        self.tag(number, WireType::Len);
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, number: u32, value: &str) -> &mut Self {
        self.bytes(number, value.as_bytes())
    }

    pub fn fixed64(&mut self, number: u32, value: u64) -> &mut Self {
        self.tag(number, WireType::I64);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn double(&mut self, number: u32, value: f64) -> &mut Self {
        self.fixed64(number, value.to_bits())
    }

    /// Splice an already-encoded field span back in verbatim.
    pub fn raw(&mut self, span: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(span);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
