use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

/// Payload is gzip-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Frame terminates a stream.
pub const FLAG_END_STREAM: u8 = 0x02;

const HEADER_LEN: usize = 5;

/// One decoded envelope. `data` is the payload after decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Frame a payload, gzipping it first when `compressed` is set.
pub fn encode_frame(payload: &[u8], compressed: bool, end_of_stream: bool) -> Vec<u8> {
    let mut flags = 0u8;
    let body = if compressed {
        match gzip(payload) {
            Ok(body) => {
                flags |= FLAG_COMPRESSED;
                body
            }
            // A failed deflate falls back to the plain payload rather than
            // producing an undecodable frame.
            Err(_) => payload.to_vec(),
        }
    } else {
        payload.to_vec()
    };
    if end_of_stream {
        flags |= FLAG_END_STREAM;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(flags);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Frame an already-encoded body verbatim under the given flags.
pub fn encode_raw_frame(flags: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(flags);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode a concatenation of envelopes.
///
/// A truncated tail frame is dropped silently; pass-through mode observes
/// partial arrivals and must tolerate them. A frame whose gzip payload fails
/// to inflate is likewise skipped.
pub fn decode_frames(buf: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos + HEADER_LEN <= buf.len() {
        let flags = buf[pos];
        let declared =
            u32::from_be_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]]) as usize;
        let body_start = pos + HEADER_LEN;
        let Some(body_end) = body_start.checked_add(declared) else {
            break;
        };
        if body_end > buf.len() {
            trace!(declared, remaining = buf.len() - body_start, "dropping truncated tail frame");
            break;
        }
        let body = &buf[body_start..body_end];
        if flags & FLAG_COMPRESSED != 0 {
            match gunzip(body) {
                Ok(data) => frames.push(Frame { flags, data }),
                Err(err) => trace!(%err, "skipping frame with undecodable gzip payload"),
            }
        } else {
            frames.push(Frame {
                flags,
                data: body.to_vec(),
            });
        }
        pos = body_end;
    }
    frames
}

/// Incremental frame decoder for streamed responses, where envelope
/// boundaries do not line up with network chunks.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every frame completed by it. Incomplete
    /// bytes are retained for the next push.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let declared = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            let Some(total) = declared.checked_add(HEADER_LEN) else {
                // unrecoverable garbage length; drop the buffer
                self.buf.clear();
                break;
            };
            if self.buf.len() < total {
                break;
            }
            let flags = self.buf[0];
            let body = &self.buf[HEADER_LEN..total];
            if flags & FLAG_COMPRESSED != 0 {
                if let Ok(data) = gunzip(body) {
                    frames.push(Frame { flags, data });
                }
            } else {
                frames.push(Frame {
                    flags,
                    data: body.to_vec(),
                });
            }
            self.buf.drain(..total);
        }
        frames
    }

    /// Bytes still waiting for completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
