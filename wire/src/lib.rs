//! Wire-level codec for the platform's RPC protocol.
//!
//! Two layers, both directions:
//!
//! * the outer envelope: a 5-byte header (1 flag byte, 4-byte big-endian
//!   length) framing an optionally gzipped payload;
//! * the inner protobuf, decoded without a schema so that untouched fields
//!   can be re-serialised byte for byte.
//!
//! The platform's server is byte-sensitive: semantically equivalent
//! re-encodings are rejected. Everything here is therefore built around raw
//! spans rather than typed messages; the only mutation the crate performs is
//! the credential splice in [`splice`].

pub mod envelope;
pub mod proto;
pub mod splice;

pub use envelope::{
    decode_frames, encode_frame, Frame, FrameAssembler, FLAG_COMPRESSED, FLAG_END_STREAM,
};
pub use proto::{
    decode_field_map, decode_raw_fields, read_varint, FieldValue, ProtoError, ProtoWriter,
    RawField, WireType,
};
pub use splice::splice_credentials;
