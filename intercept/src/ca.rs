use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, info};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key";

/// Internal certificate authority used to mint leaves for intercepted SNIs.
///
/// The key+cert pair persists on disk so the operator installs the root
/// once. Leaves live in a keyed lazy cache: the first connection for a name
/// mints, later ones reuse, entries last for the process lifetime.
pub struct CertAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertAuthority")
            .field("cached_leaves", &self.cache.len())
            .finish()
    }
}

impl CertAuthority {
    /// Load the persisted CA or generate and persist a fresh one.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path).context("reading CA certificate")?;
            let key_pem = fs::read_to_string(&key_path).context("reading CA key")?;
            let ca_key = KeyPair::from_pem(&key_pem).context("parsing CA key")?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .context("parsing CA certificate")?;
            let ca_cert = params
                .self_signed(&ca_key)
                .context("rebuilding CA certificate")?;
            debug!(path = %cert_path.display(), "certificate authority loaded");
            return Ok(Self {
                ca_cert,
                ca_key,
                cache: DashMap::new(),
            });
        }

        let ca_key = KeyPair::generate().context("generating CA key")?;
        let mut params = CertificateParams::new(Vec::<String>::new())
            .context("building CA parameters")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Slipstream Interception CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "slipstream");
        let ca_cert = params.self_signed(&ca_key).context("signing CA")?;

        fs::create_dir_all(dir).context("creating CA directory")?;
        fs::write(&cert_path, ca_cert.pem()).context("persisting CA certificate")?;
        fs::write(&key_path, ca_key.serialize_pem()).context("persisting CA key")?;
        info!(path = %cert_path.display(), "certificate authority generated");

        Ok(Self {
            ca_cert,
            ca_key,
            cache: DashMap::new(),
        })
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Leaf for an SNI, minted on first use.
    pub fn leaf_for(&self, sni: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(existing) = self.cache.get(sni) {
            return Ok(existing.clone());
        }
        // entry() holds the shard lock, so concurrent first callers for the
        // same name wait on the mint instead of duplicating it
        let entry = self
            .cache
            .entry(sni.to_string())
            .or_try_insert_with(|| self.mint(sni))?;
        Ok(entry.value().clone())
    }

    fn mint(&self, sni: &str) -> Result<Arc<CertifiedKey>> {
        let leaf_key = KeyPair::generate().context("generating leaf key")?;
        let mut params = CertificateParams::new(vec![sni.to_string()])
            .with_context(|| format!("building leaf parameters for {sni}"))?;
        params.distinguished_name.push(DnType::CommonName, sni);
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("signing leaf for {sni}"))?;
        info!(%sni, "minted forged leaf certificate");

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = any_supported_type(&key_der)
            .map_err(|err| anyhow::anyhow!("unusable leaf key: {err}"))?;
        Ok(Arc::new(CertifiedKey::new(
            vec![leaf.der().clone(), self.ca_cert.der().clone()],
            signing_key,
        )))
    }

    #[cfg(test)]
    pub fn cached_leaves(&self) -> usize {
        self.cache.len()
    }
}
