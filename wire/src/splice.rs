use tracing::trace;

use crate::envelope::{encode_raw_frame, gunzip, gzip, FLAG_COMPRESSED};
use crate::proto::{decode_raw_fields_checked, ProtoWriter, WireType};

/// Outer field carrying the client-metadata submessage.
const FIELD_CLIENT_METADATA: u32 = 1;
/// Inner field carrying the API key (string).
const FIELD_API_KEY: u32 = 3;
/// Inner field carrying the JWT (string).
const FIELD_JWT: u32 = 21;

/// Rewrite the credentials embedded in a captured request buffer.
///
/// The buffer may be a single outer envelope (flag byte `0x00`/`0x01` with a
/// matching declared length) or a bare protobuf message, since some platform
/// endpoints use a bare `application/proto` media type. Inside the message,
/// field 1 is the client-metadata submessage: its field 3 is replaced (or
/// injected at the head) with `api_key`, field 21 is replaced when `jwt` is
/// `Some` and omitted entirely when `None`. Every other field, inner and
/// outer, is re-emitted from its original bytes in original order.
///
/// Any malformation (a buffer under two bytes, an unparseable message, a
/// failed re-compression) yields the input unchanged; the upstream will
/// reject it and the caller carries on.
pub fn splice_credentials(buf: &[u8], api_key: &str, jwt: Option<&str>) -> Vec<u8> {
    if buf.len() < 2 {
        return buf.to_vec();
    }

    if let Some((flags, payload)) = detect_envelope(buf) {
        let compressed = flags & FLAG_COMPRESSED != 0;
        let plain = if compressed {
            match gunzip(payload) {
                Ok(plain) => plain,
                Err(err) => {
                    trace!(%err, "envelope payload failed to inflate; leaving buffer untouched");
                    return buf.to_vec();
                }
            }
        } else {
            payload.to_vec()
        };
        let Some(rewritten) = rewrite_message(&plain, api_key, jwt) else {
            return buf.to_vec();
        };
        let body = if compressed {
            match gzip(&rewritten) {
                Ok(body) => body,
                Err(err) => {
                    trace!(%err, "re-compression failed; leaving buffer untouched");
                    return buf.to_vec();
                }
            }
        } else {
            rewritten
        };
        return encode_raw_frame(flags, &body);
    }

    if looks_like_protobuf(buf) {
        if let Some(rewritten) = rewrite_message(buf, api_key, jwt) {
            return rewritten;
        }
    }
    buf.to_vec()
}

/// An envelope starts with a plain or compressed flag byte and declares
/// exactly the remaining length.
fn detect_envelope(buf: &[u8]) -> Option<(u8, &[u8])> {
    if buf.len() < 5 {
        return None;
    }
    let flags = buf[0];
    if flags != 0x00 && flags != FLAG_COMPRESSED {
        return None;
    }
    let declared = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if declared != buf.len() - 5 {
        return None;
    }
    Some((flags, &buf[5..]))
}

/// A bare message plausibly starts with a LEN tag for a low field number,
/// e.g. `0x0a` for field 1.
fn looks_like_protobuf(buf: &[u8]) -> bool {
    let tag = buf[0];
    let wire_type = tag & 0x07;
    let number = tag >> 3;
    number > 0 && matches!(wire_type, 0 | 1 | 2 | 5)
}

fn rewrite_message(msg: &[u8], api_key: &str, jwt: Option<&str>) -> Option<Vec<u8>> {
    let (outer, consumed) = decode_raw_fields_checked(msg);
    // A partial parse would silently drop trailing bytes on re-serialisation.
    if consumed != msg.len() || outer.is_empty() {
        return None;
    }

    let metadata_index = outer
        .iter()
        .position(|f| f.number == FIELD_CLIENT_METADATA && f.wire_type == WireType::Len);

    let new_metadata = match metadata_index {
        Some(index) => rewrite_metadata(outer[index].payload, api_key, jwt)?,
        None => {
            let mut writer = ProtoWriter::new();
            writer.string(FIELD_API_KEY, api_key);
            if let Some(jwt) = jwt {
                writer.string(FIELD_JWT, jwt);
            }
            writer.into_bytes()
        }
    };

    let mut out = ProtoWriter::new();
    match metadata_index {
        Some(index) => {
            for (position, field) in outer.iter().enumerate() {
                if position == index {
                    out.bytes(FIELD_CLIENT_METADATA, &new_metadata);
                } else {
                    out.raw(field.raw);
                }
            }
        }
        None => {
            out.bytes(FIELD_CLIENT_METADATA, &new_metadata);
            for field in &outer {
                out.raw(field.raw);
            }
        }
    }
    Some(out.into_bytes())
}

fn rewrite_metadata(metadata: &[u8], api_key: &str, jwt: Option<&str>) -> Option<Vec<u8>> {
    let (inner, consumed) = decode_raw_fields_checked(metadata);
    if consumed != metadata.len() {
        return None;
    }

    let has_api_key = inner.iter().any(|f| f.number == FIELD_API_KEY);
    let mut writer = ProtoWriter::new();
    if !has_api_key {
        writer.string(FIELD_API_KEY, api_key);
    }

    let mut api_key_written = false;
    let mut jwt_written = false;
    for field in &inner {
        match field.number {
            FIELD_API_KEY => {
                if !api_key_written {
                    writer.string(FIELD_API_KEY, api_key);
                    api_key_written = true;
                }
            }
            FIELD_JWT => {
                if let Some(jwt) = jwt {
                    if !jwt_written {
                        writer.string(FIELD_JWT, jwt);
                        jwt_written = true;
                    }
                }
                // jwt == None omits the field entirely.
            }
            _ => {
                writer.raw(field.raw);
            }
        }
    }
    if let Some(jwt) = jwt {
        if !jwt_written {
            writer.string(FIELD_JWT, jwt);
        }
    }
    Some(writer.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode_frames, encode_frame};
    use crate::proto::{decode_field_map, decode_raw_fields, FieldValue};

    fn sample_request(api_key: &str, jwt: Option<&str>) -> Vec<u8> {
        let mut metadata = ProtoWriter::new();
        metadata
            .string(FIELD_API_KEY, api_key)
            .string(8, "en-US")
            .varint(16, 3);
        if let Some(jwt) = jwt {
            metadata.string(FIELD_JWT, jwt);
        }
        metadata.string(22, "machine-77");
        let mut outer = ProtoWriter::new();
        outer
            .bytes(FIELD_CLIENT_METADATA, &metadata.into_bytes())
            .string(2, "what does this function do")
            .varint(7, 1);
        outer.into_bytes()
    }

    fn metadata_strings(msg: &[u8]) -> Vec<(u32, String)> {
        let outer = decode_raw_fields(msg);
        let metadata = outer
            .iter()
            .find(|f| f.number == FIELD_CLIENT_METADATA)
            .expect("metadata present");
        decode_field_map(metadata.payload)
            .into_iter()
            .filter_map(|(number, value)| match value {
                FieldValue::Bytes(bytes) => {
                    Some((number, String::from_utf8_lossy(bytes).into_owned()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn replaces_api_key_and_jwt() {
        let original = sample_request("old-key", Some("old-jwt"));
        let spliced = splice_credentials(&original, "new-key", Some("new-jwt"));
        let strings = metadata_strings(&spliced);
        assert!(strings.contains(&(FIELD_API_KEY, "new-key".into())));
        assert!(strings.contains(&(FIELD_JWT, "new-jwt".into())));
        assert!(!strings.iter().any(|(_, s)| s == "old-key" || s == "old-jwt"));
    }

    #[test]
    fn omits_jwt_when_session_has_none() {
        let original = sample_request("old-key", Some("old-jwt"));
        let spliced = splice_credentials(&original, "new-key", None);
        let strings = metadata_strings(&spliced);
        assert!(strings.contains(&(FIELD_API_KEY, "new-key".into())));
        assert!(!strings.iter().any(|(number, _)| *number == FIELD_JWT));
    }

    #[test]
    fn untouched_outer_fields_are_byte_equal() {
        let original = sample_request("old-key", Some("old-jwt"));
        let spliced = splice_credentials(&original, "new-key", Some("new-jwt"));

        let before: Vec<_> = decode_raw_fields(&original)
            .into_iter()
            .filter(|f| f.number != FIELD_CLIENT_METADATA)
            .map(|f| f.raw.to_vec())
            .collect();
        let after: Vec<_> = decode_raw_fields(&spliced)
            .into_iter()
            .filter(|f| f.number != FIELD_CLIENT_METADATA)
            .map(|f| f.raw.to_vec())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn untouched_metadata_fields_are_byte_equal() {
        let original = sample_request("old-key", Some("old-jwt"));
        let spliced = splice_credentials(&original, "new-key", None);

        let untouched = |msg: &[u8]| -> Vec<Vec<u8>> {
            let outer = decode_raw_fields(msg);
            let metadata = outer
                .iter()
                .find(|f| f.number == FIELD_CLIENT_METADATA)
                .unwrap()
                .payload;
            decode_raw_fields(metadata)
                .into_iter()
                .filter(|f| f.number != FIELD_API_KEY && f.number != FIELD_JWT)
                .map(|f| f.raw.to_vec())
                .collect()
        };
        assert_eq!(untouched(&original), untouched(&spliced));
    }

    #[test]
    fn injects_metadata_when_absent() {
        let mut outer = ProtoWriter::new();
        outer.string(2, "prompt only").varint(7, 4);
        let original = outer.into_bytes();

        let spliced = splice_credentials(&original, "fresh-key", None);
        let fields = decode_raw_fields(&spliced);
        assert_eq!(fields[0].number, FIELD_CLIENT_METADATA);
        let strings = metadata_strings(&spliced);
        assert_eq!(strings, vec![(FIELD_API_KEY, "fresh-key".into())]);

        // remaining outer fields preserved verbatim, in order
        let rest: Vec<_> = fields[1..].iter().map(|f| f.raw.to_vec()).collect();
        let orig: Vec<_> = decode_raw_fields(&original)
            .iter()
            .map(|f| f.raw.to_vec())
            .collect();
        assert_eq!(rest, orig);
    }

    #[test]
    fn injects_api_key_at_metadata_head_when_missing() {
        let mut metadata = ProtoWriter::new();
        metadata.string(8, "en-GB");
        let mut outer = ProtoWriter::new();
        outer.bytes(FIELD_CLIENT_METADATA, &metadata.into_bytes());
        let original = outer.into_bytes();

        let spliced = splice_credentials(&original, "injected", None);
        let strings = metadata_strings(&spliced);
        assert_eq!(strings[0], (FIELD_API_KEY, "injected".into()));
        assert_eq!(strings[1], (8, "en-GB".into()));
    }

    #[test]
    fn splices_through_plain_envelope() {
        let inner = sample_request("old-key", Some("old-jwt"));
        let enveloped = encode_frame(&inner, false, false);
        let spliced = splice_credentials(&enveloped, "new-key", Some("new-jwt"));

        let frames = decode_frames(&spliced);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_compressed());
        let strings = metadata_strings(&frames[0].data);
        assert!(strings.contains(&(FIELD_API_KEY, "new-key".into())));
    }

    #[test]
    fn splices_through_compressed_envelope_preserving_flag() {
        let inner = sample_request("old-key", None);
        let enveloped = encode_frame(&inner, true, false);
        let spliced = splice_credentials(&enveloped, "new-key", Some("jwt"));

        assert_eq!(spliced[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        let frames = decode_frames(&spliced);
        assert_eq!(frames.len(), 1);
        let strings = metadata_strings(&frames[0].data);
        assert!(strings.contains(&(FIELD_API_KEY, "new-key".into())));
        assert!(strings.contains(&(FIELD_JWT, "jwt".into())));
    }

    #[test]
    fn tiny_or_malformed_buffers_pass_through() {
        assert_eq!(splice_credentials(&[], "k", None), Vec::<u8>::new());
        assert_eq!(splice_credentials(&[0x0a], "k", None), vec![0x0a]);
        let garbage = vec![0xff, 0xff, 0xff, 0xff];
        assert_eq!(splice_credentials(&garbage, "k", None), garbage);
    }

    #[test]
    fn corrupt_envelope_payload_passes_through() {
        // compressed flag set but payload is not gzip
        let mut buf = vec![FLAG_COMPRESSED];
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"junk");
        assert_eq!(splice_credentials(&buf, "k", None), buf);
    }
}
