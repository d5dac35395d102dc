use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::ClientConfig;
use rustls::server::{ClientHello, ResolvesServerCert, ServerConfig};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::trace;

use crate::ca::CertAuthority;

/// Install the process crypto provider. Safe to call more than once.
pub fn init_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Resolves the serving certificate from the requested SNI, minting a
/// forged leaf through the internal CA on first sight.
pub struct SniLeafResolver {
    ca: Arc<CertAuthority>,
}

impl fmt::Debug for SniLeafResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniLeafResolver").finish()
    }
}

impl ResolvesServerCert for SniLeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        trace!(sni = name, "resolving forged leaf");
        self.ca.leaf_for(name).ok()
    }
}

/// Server-side acceptor that answers any SNI with a forged leaf.
pub fn build_acceptor(ca: Arc<CertAuthority>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniLeafResolver { ca }));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// Client-side connector for passthrough dials, anchored on real system
/// trust; the platform must see nothing unusual.
pub fn build_upstream_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs()
        .context("loading system root certificates")?;
    for cert in native {
        // ignore the occasional unparseable store entry
        let _ = roots.add(cert);
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
