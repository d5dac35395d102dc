use std::sync::Arc;

use slipstream_wire::envelope::{decode_frames, encode_frame, Frame};
use slipstream_wire::proto::{decode_raw_fields_checked, ProtoWriter, WireType};

use crate::session::Session;

/// A fully built platform-bound HTTP request, minus transport concerns.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub url: String,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub bearer: String,
}

/// Thin indirection over platform-specific wire details: which host, which
/// RPC paths, how to build probe requests, and how chat text maps onto the
/// platform's envelopes.
pub trait PlatformAdapter: Send + Sync {
    fn id(&self) -> &'static str;
    fn canonical_host(&self) -> &str;

    fn base_url(&self) -> String {
        format!("https://{}", self.canonical_host())
    }

    /// Path prefix identifying this platform's RPC surface.
    fn rpc_prefix(&self) -> &'static str;

    /// Full path of the chat-message RPC, used for credit scanning.
    fn chat_method_path(&self) -> &'static str;

    /// The platform accepts `application/grpc` where IDE clients send the
    /// Connect framing label.
    fn normalise_content_type<'a>(&self, content_type: &'a str) -> &'a str;

    fn keepalive_request(&self, session: &Session) -> AdapterRequest;
    fn health_request(&self, session: &Session) -> AdapterRequest;

    /// Build a chat-message request from flattened prompt text.
    fn to_platform(&self, model: &str, prompt: &str, session: &Session) -> AdapterRequest;

    /// Best-effort text extraction from a full response body.
    fn from_platform(&self, body: &[u8]) -> Option<String>;

    /// Chunk-level extraction for streamed responses.
    fn from_platform_stream_chunk(&self, frame: &Frame) -> Option<String>;
}

/// The Windsurf-shaped default adapter (`/exa.*` RPC surface).
pub struct WindsurfAdapter {
    host: String,
}

impl WindsurfAdapter {
    pub const STATUS_METHOD: &'static str = "/exa.api_server_pb.ApiServerService/GetUserStatus";
    pub const CHAT_METHOD: &'static str = "/exa.api_server_pb.ApiServerService/GetChatMessage";

    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Client-metadata submessage carrying the session identity. Field
    /// numbers follow the observed capture layout; anything unobserved is
    /// simply not emitted.
    fn metadata(&self, session: &Session) -> Vec<u8> {
        let mut writer = ProtoWriter::new();
        writer.string(3, &session.credentials.api_key);
        if let Some(version) = session.credentials.editor_version.as_deref() {
            writer.string(8, version);
        }
        if let Some(os_tag) = session.credentials.os_tag.as_deref() {
            writer.string(20, os_tag);
        }
        if let Some(jwt) = session.credentials.jwt.as_deref() {
            writer.string(21, jwt);
        }
        if let Some(machine_id) = session.credentials.machine_id.as_deref() {
            writer.string(22, machine_id);
        }
        writer.into_bytes()
    }

    fn status_request(&self, session: &Session) -> AdapterRequest {
        let mut outer = ProtoWriter::new();
        outer.bytes(1, &self.metadata(session));
        AdapterRequest {
            url: format!("{}{}", self.base_url(), Self::STATUS_METHOD),
            content_type: "application/connect+proto",
            body: encode_frame(&outer.into_bytes(), false, false),
            bearer: session.bearer().to_string(),
        }
    }
}

impl PlatformAdapter for WindsurfAdapter {
    fn id(&self) -> &'static str {
        "windsurf"
    }

    fn canonical_host(&self) -> &str {
        &self.host
    }

    fn rpc_prefix(&self) -> &'static str {
        "exa."
    }

    fn chat_method_path(&self) -> &'static str {
        Self::CHAT_METHOD
    }

    fn normalise_content_type<'a>(&self, content_type: &'a str) -> &'a str {
        if content_type.starts_with("application/connect+proto") {
            "application/grpc"
        } else {
            content_type
        }
    }

    fn keepalive_request(&self, session: &Session) -> AdapterRequest {
        self.status_request(session)
    }

    fn health_request(&self, session: &Session) -> AdapterRequest {
        self.status_request(session)
    }

    fn to_platform(&self, model: &str, prompt: &str, session: &Session) -> AdapterRequest {
        let mut outer = ProtoWriter::new();
        outer
            .bytes(1, &self.metadata(session))
            .string(2, prompt)
            .string(16, model);
        AdapterRequest {
            url: format!("{}{}", self.base_url(), Self::CHAT_METHOD),
            content_type: "application/connect+proto",
            body: encode_frame(&outer.into_bytes(), false, false),
            bearer: session.bearer().to_string(),
        }
    }

    fn from_platform(&self, body: &[u8]) -> Option<String> {
        let frames = decode_frames(body);
        let mut text = String::new();
        if frames.is_empty() {
            // bare protobuf body
            collect_text(body, 0, &mut text);
        } else {
            for frame in &frames {
                if frame.is_end_of_stream() {
                    continue;
                }
                collect_text(&frame.data, 0, &mut text);
            }
        }
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn from_platform_stream_chunk(&self, frame: &Frame) -> Option<String> {
        if frame.is_end_of_stream() {
            return None;
        }
        let mut text = String::new();
        collect_text(&frame.data, 0, &mut text);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

const MAX_TEXT_DEPTH: usize = 4;

/// Walk LEN fields, descending into spans that parse as messages and
/// harvesting the ones that read as text. The platform's response schema is
/// not declared anywhere, so this is deliberately a scan, not a decode.
fn collect_text(msg: &[u8], depth: usize, out: &mut String) {
    if depth > MAX_TEXT_DEPTH {
        return;
    }
    let (fields, consumed) = decode_raw_fields_checked(msg);
    if consumed != msg.len() {
        return;
    }
    for field in fields {
        if field.wire_type != WireType::Len || field.payload.is_empty() {
            continue;
        }
        let (nested, nested_consumed) = decode_raw_fields_checked(field.payload);
        if !nested.is_empty() && nested_consumed == field.payload.len() {
            collect_text(field.payload, depth + 1, out);
            continue;
        }
        if let Ok(s) = std::str::from_utf8(field.payload) {
            if is_mostly_printable(s) {
                out.push_str(s);
            }
        }
    }
}

fn is_mostly_printable(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let printable = s
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .count();
    printable * 10 >= s.chars().count() * 9
}

/// Maps a platform tag to its adapter; unknown tags fall back to the
/// default Windsurf shape.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new(platform_host: &str) -> Self {
        Self {
            adapters: vec![Arc::new(WindsurfAdapter::new(platform_host))],
        }
    }

    pub fn get(&self, platform: &str) -> Arc<dyn PlatformAdapter> {
        self.adapters
            .iter()
            .find(|a| a.id() == platform)
            .cloned()
            .unwrap_or_else(|| self.adapters[0].clone())
    }

    pub fn default_adapter(&self) -> Arc<dyn PlatformAdapter> {
        self.adapters[0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionCredentials;
    use slipstream_wire::proto::{decode_field_map, decode_raw_fields, FieldValue};

    fn session() -> Session {
        Session::new(
            "s1",
            "windsurf",
            SessionCredentials {
                api_key: "key-1".into(),
                jwt: Some("jwt-1".into()),
                machine_id: Some("m-1".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn content_type_normalisation() {
        let adapter = WindsurfAdapter::new("server.example.com");
        assert_eq!(
            adapter.normalise_content_type("application/connect+proto"),
            "application/grpc"
        );
        assert_eq!(
            adapter.normalise_content_type("application/proto"),
            "application/proto"
        );
    }

    #[test]
    fn probe_request_carries_session_credentials() {
        let adapter = WindsurfAdapter::new("server.example.com");
        let request = adapter.health_request(&session());
        assert!(request.url.ends_with(WindsurfAdapter::STATUS_METHOD));
        assert_eq!(request.bearer, "jwt-1");

        let frames = decode_frames(&request.body);
        assert_eq!(frames.len(), 1);
        let outer = decode_raw_fields(&frames[0].data);
        assert_eq!(outer[0].number, 1);
        let strings: Vec<_> = decode_field_map(outer[0].payload)
            .into_iter()
            .filter_map(|(n, v)| match v {
                FieldValue::Bytes(b) => Some((n, String::from_utf8_lossy(b).into_owned())),
                _ => None,
            })
            .collect();
        assert!(strings.contains(&(3, "key-1".into())));
        assert!(strings.contains(&(21, "jwt-1".into())));
    }

    #[test]
    fn chat_text_roundtrips_through_scan() {
        let adapter = WindsurfAdapter::new("server.example.com");
        let request = adapter.to_platform("gpt-4o", "explain lifetimes", &session());
        let text = adapter.from_platform(&request.body).expect("text found");
        assert!(text.contains("explain lifetimes"));
    }

    #[test]
    fn extracts_text_from_compressed_frames() {
        let adapter = WindsurfAdapter::new("server.example.com");
        let mut msg = ProtoWriter::new();
        msg.string(2, "served by claude-sonnet-4-20250514");
        let body = encode_frame(&msg.into_bytes(), true, false);

        let text = adapter.from_platform(&body).expect("text recovered");
        assert!(text.contains("claude-sonnet-4"));
    }

    #[test]
    fn registry_falls_back_to_default() {
        let registry = AdapterRegistry::new("server.example.com");
        assert_eq!(registry.get("windsurf").id(), "windsurf");
        assert_eq!(registry.get("unknown-platform").id(), "windsurf");
    }
}
