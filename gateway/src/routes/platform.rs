use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::TRANSFER_ENCODING;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::StreamExt;
use slipstream_core::{token_fingerprint, GatewayError};
use slipstream_quota::{detect_model, estimate_cost};
use slipstream_wire::splice_credentials;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::events::{EventMode, EventRecord};
use crate::routes::{bearer_token, ClientIp};
use crate::state::AppState;

/// Response prefix retained for the model scan on chat-message responses.
const SCAN_LIMIT: usize = 64 * 1024;

/// The platform RPC pass-through: splice credentials, forward, relay bytes
/// verbatim. Chat-message responses are scanned (bounded, on the fly) for
/// the model name so session credits can be deducted by its weight.
pub async fn passthrough(
    State(state): State<AppState>,
    client_ip: ClientIp,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let adapter = state.adapters.default_adapter();
    let path = format!("/{service}/{method}");
    let ip = client_ip.ip_string();
    let token_hash = bearer_token(&headers).map(token_fingerprint);

    if !service.starts_with(adapter.rpc_prefix()) {
        let mut record = EventRecord::new("POST", &path, &ip, EventMode::WindsurfProxy, 404);
        record.token_hash = token_hash;
        record.reason = Some("not_found".into());
        state.events.append(record);
        return Err(GatewayError::NotFound.into());
    }

    let started = Instant::now();
    let concurrency = state.bandwidth.begin();
    let bytes_in = body.len() as u64;

    let Some(session) = state.affinity.resolve(&ip, &state.sessions) else {
        let mut record = EventRecord::new("POST", &path, &ip, EventMode::WindsurfProxy, 503);
        record.token_hash = token_hash;
        record.reason = Some("no_available_account".into());
        state.events.append(record);
        state
            .bandwidth
            .record(started.elapsed(), bytes_in, 0, 503);
        return Err(GatewayError::NoAvailableAccount.into());
    };

    let spliced = splice_credentials(
        &body,
        &session.credentials.api_key,
        session.credentials.jwt.as_deref(),
    );

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/connect+proto");
    let content_type = adapter.normalise_content_type(content_type).to_string();
    let url = format!("{}{}", adapter.base_url(), path);

    let upstream = match state
        .upstream
        .forward_platform(&url, &content_type, session.bearer(), &headers, spliced)
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            let status = err.status();
            let mut record =
                EventRecord::new("POST", &path, &ip, EventMode::WindsurfProxy, status);
            record.token_hash = token_hash;
            record.session_id = Some(session.id.clone());
            record.reason = Some(err.kind().into());
            state.events.append(record);
            state
                .bandwidth
                .record(started.elapsed(), bytes_in, 0, status);
            return Err(err.into());
        }
    };

    let status = upstream.status();
    let mut record = EventRecord::new(
        "POST",
        &path,
        &ip,
        EventMode::WindsurfProxy,
        status.as_u16(),
    );
    record.token_hash = token_hash;
    record.session_id = Some(session.id.clone());
    let seq = state.events.append(record);
    debug!(%path, session = %session.id, status = status.as_u16(), "platform pass-through");

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if name == TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let is_chat = path == adapter.chat_method_path();
    let success = status.is_success();
    let adapter_for_scan = adapter.clone();
    let sessions = state.sessions.clone();
    let affinity = state.affinity.clone();
    let events = state.events.clone();
    let bandwidth = state.bandwidth.clone();
    let session_id = session.id.clone();

    // bytes flow straight through; only a bounded prefix is retained for
    // the model scan
    let body_stream = async_stream::stream! {
        let mut upstream_body = upstream.bytes_stream();
        let mut scan_buf: Vec<u8> = Vec::new();
        let mut bytes_out = 0u64;
        while let Some(chunk) = upstream_body.next().await {
            match chunk {
                Ok(bytes) => {
                    bytes_out += bytes.len() as u64;
                    if is_chat && success && scan_buf.len() < SCAN_LIMIT {
                        let room = SCAN_LIMIT - scan_buf.len();
                        scan_buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
                    }
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Err(err) => {
                    warn!(%err, "platform response stream interrupted");
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, err));
                    break;
                }
            }
        }

        if is_chat && success {
            // the retained prefix is still enveloped (and possibly
            // gzipped); only this copy is decoded, the relayed bytes
            // stay untouched
            let text = adapter_for_scan.from_platform(&scan_buf).unwrap_or_default();
            if let Some(model) = detect_model(&text) {
                let cost = estimate_cost(model);
                let remaining = sessions.deduct_credits(&session_id, cost, Some(model));
                events.update(seq, |record| {
                    record.model = Some(model.to_string());
                    record.credit_cost = Some(cost);
                });
                if let Some(remaining) = remaining {
                    if remaining <= 0.0 {
                        info!(session = %session_id, "session credits depleted, evicting bindings");
                        affinity.evict_session(&session_id);
                    }
                }
            }
        }
        bandwidth.record(started.elapsed(), bytes_in, bytes_out, status.as_u16());
        drop(concurrency);
    };

    builder
        .body(Body::from_stream(body_stream))
        .map_err(|err| ApiError(GatewayError::Internal(err.to_string())))
}
