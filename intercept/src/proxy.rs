use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use slipstream_core::InterceptConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::ca::CertAuthority;
use crate::dns::BypassResolver;
use crate::tls::{build_acceptor, build_upstream_connector};

const PLATFORM_TLS_PORT: u16 = 443;

type RelayBody = BoxBody<Bytes, std::io::Error>;

/// What happens after TLS termination.
#[derive(Debug, Clone)]
pub enum ProxyMode {
    /// Splice bytes to the true platform, resolved via the bypass resolver.
    Passthrough,
    /// Re-issue each RPC against the gateway; never dial the platform.
    Gateway { gateway_url: String },
}

/// The local interception proxy: a TLS server on 443 accepting any SNI with
/// leaves forged from the internal CA.
pub struct InterceptProxy {
    acceptor: TlsAcceptor,
    connector: tokio_rustls::TlsConnector,
    dns: BypassResolver,
    mode: ProxyMode,
    http: reqwest::Client,
}

impl InterceptProxy {
    pub fn new(config: &InterceptConfig, ca: Arc<CertAuthority>) -> Result<Self> {
        let mode = match config.gateway_url.as_deref() {
            Some(url) => ProxyMode::Gateway {
                gateway_url: url.trim_end_matches('/').to_string(),
            },
            None => ProxyMode::Passthrough,
        };
        let resolver_ip = config
            .bypass_resolver_ip
            .parse()
            .context("invalid bypass resolver address")?;
        Ok(Self {
            acceptor: build_acceptor(ca),
            connector: build_upstream_connector()?,
            dns: BypassResolver::new(resolver_ip),
            mode,
            http: reqwest::Client::builder()
                .build()
                .context("building gateway-mode HTTP client")?,
        })
    }

    pub fn mode(&self) -> &ProxyMode {
        &self.mode
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(mode = ?self.mode, "interception proxy accepting connections");
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = proxy.handle(stream, peer).await {
                    debug!(%peer, %err, "connection ended with error");
                }
            });
        }
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;
        let sni = tls
            .get_ref()
            .1
            .server_name()
            .map(str::to_string)
            .unwrap_or_default();
        debug!(%peer, %sni, "intercepted connection");

        match self.mode.clone() {
            ProxyMode::Passthrough => self.passthrough(tls, &sni).await,
            ProxyMode::Gateway { gateway_url } => self.serve_gateway(tls, gateway_url).await,
        }
    }

    /// Capture mode: open a genuine TLS session to the platform and splice
    /// bytes both ways.
    async fn passthrough(
        &self,
        mut downstream: tokio_rustls::server::TlsStream<TcpStream>,
        sni: &str,
    ) -> Result<()> {
        if sni.is_empty() {
            anyhow::bail!("passthrough requires an SNI");
        }
        let address = self.dns.resolve(sni).await?;
        let tcp = TcpStream::connect((address, PLATFORM_TLS_PORT))
            .await
            .with_context(|| format!("dialing {sni} at {address}"))?;
        let server_name =
            ServerName::try_from(sni.to_string()).context("invalid upstream server name")?;
        let mut upstream = self
            .connector
            .connect(server_name, tcp)
            .await
            .context("upstream TLS handshake failed")?;
        let (to_upstream, to_client) =
            tokio::io::copy_bidirectional(&mut downstream, &mut upstream)
                .await
                .context("splice failed")?;
        debug!(%sni, to_upstream, to_client, "passthrough finished");
        Ok(())
    }

    /// Gateway mode: answer the intercepted connection with HTTP (h1 or h2)
    /// and replay each request against the gateway under the same RPC path.
    async fn serve_gateway(
        self: Arc<Self>,
        tls: tokio_rustls::server::TlsStream<TcpStream>,
        gateway_url: String,
    ) -> Result<()> {
        let proxy = Arc::clone(&self);
        let service = service_fn(move |request: Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            let gateway_url = gateway_url.clone();
            async move { proxy.forward_to_gateway(request, &gateway_url).await }
        });
        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls), service)
            .await
            .map_err(|err| anyhow::anyhow!("gateway-mode connection failed: {err}"))
    }

    async fn forward_to_gateway(
        &self,
        request: Request<Incoming>,
        gateway_url: &str,
    ) -> Result<Response<RelayBody>, hyper::Error> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let body = body.collect().await?.to_bytes();

        let mut outbound = self
            .http
            .request(parts.method.clone(), format!("{gateway_url}{path}"))
            .body(body.to_vec());
        for (name, value) in &parts.headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if lowered == "host" || lowered == "content-length" {
                continue;
            }
            outbound = outbound.header(name, value);
        }

        match outbound.send().await {
            Ok(upstream) => Ok(relay(upstream)),
            Err(err) => {
                warn!(%err, "gateway unreachable");
                Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "gateway unreachable",
                ))
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .expect("static response is valid")
}

/// Stream a reqwest response back out on the intercepted connection.
fn relay(upstream: reqwest::Response) -> Response<RelayBody> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
    let body = StreamBody::new(stream).boxed();

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if name == hyper::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "invalid upstream response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::init_crypto;
    use tempfile::tempdir;

    fn config(gateway_url: Option<&str>, dir: &std::path::Path) -> InterceptConfig {
        InterceptConfig {
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            gateway_url: gateway_url.map(str::to_string),
            platform_host: "server.example.com".into(),
            bypass_resolver_ip: "8.8.8.8".into(),
            ca_dir: dir.join("ca"),
            pid_file: dir.join("intercept.pid"),
            hosts_helper: None,
            log_level: "info".into(),
            log_format: "pretty".into(),
        }
    }

    #[test]
    fn mode_follows_gateway_url_presence() {
        init_crypto();
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertAuthority::load_or_generate(&dir.path().join("ca")).unwrap());

        let passthrough =
            InterceptProxy::new(&config(None, dir.path()), ca.clone()).expect("proxy");
        assert!(matches!(passthrough.mode(), ProxyMode::Passthrough));

        let gatewayed =
            InterceptProxy::new(&config(Some("https://gw.example.com/"), dir.path()), ca)
                .expect("proxy");
        match gatewayed.mode() {
            ProxyMode::Gateway { gateway_url } => {
                assert_eq!(gateway_url, "https://gw.example.com");
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
