//! Per-replica serving certificate watcher
//!
//! Every replica runs a [`CertProvider`] that keeps an in-memory copy of the
//! serving keypair and exposes it to the TLS listener through a
//! [`CertStore`]. The store is a single atomic pointer: many concurrent
//! readers (TLS handshakes), one writer (the watcher callback), no locks.
//!
//! The provider tolerates the secret not existing yet - the leader creates
//! and fills it eventually - and keeps the previous keypair installed when
//! an update carries unparseable material.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::pki::{ParsedCertificate, PkiError};

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// In-memory serving keypair shared with the TLS listener.
///
/// Implements [`ResolvesServerCert`], so it plugs directly into a rustls
/// `ServerConfig`. Until the first keypair is installed, handshakes fail
/// and readiness reports false.
#[derive(Default)]
pub struct CertStore {
    current: ArcSwapOption<CertifiedKey>,
    ready: AtomicBool,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("ready", &self.ready())
            .field("installed", &self.current.load().is_some())
            .finish()
    }
}

impl CertStore {
    /// Parse PEM material and atomically install it as the serving keypair.
    ///
    /// Returns the parsed leaf certificate on success. On failure the
    /// previously installed keypair stays in place.
    pub fn install(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<ParsedCertificate, PkiError> {
        let blocks = ::pem::parse_many(cert_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate PEM: {}", e)))?;
        let certs: Vec<CertificateDer<'static>> = blocks
            .iter()
            .filter(|b| b.tag() == "CERTIFICATE")
            .map(|b| CertificateDer::from(b.contents().to_vec()))
            .collect();
        let Some(leaf_der) = certs.first() else {
            return Err(PkiError::Parse(
                "no CERTIFICATE block in tls.crt".to_string(),
            ));
        };
        let leaf = ParsedCertificate::from_der(leaf_der.to_vec())?;

        let key_block = ::pem::parse(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse key PEM: {}", e)))?;
        let key_der: PrivateKeyDer<'static> = match key_block.tag() {
            "PRIVATE KEY" => PrivatePkcs8KeyDer::from(key_block.contents().to_vec()).into(),
            "RSA PRIVATE KEY" => PrivatePkcs1KeyDer::from(key_block.contents().to_vec()).into(),
            "EC PRIVATE KEY" => PrivateSec1KeyDer::from(key_block.contents().to_vec()).into(),
            other => {
                return Err(PkiError::Parse(format!(
                    "unsupported private key block: {}",
                    other
                )))
            }
        };
        let signing_key = aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(|e| PkiError::Parse(format!("unusable private key: {}", e)))?;

        self.current
            .store(Some(Arc::new(CertifiedKey::new(certs, signing_key))));
        self.ready.store(true, Ordering::SeqCst);
        Ok(leaf)
    }

    /// The most recently installed keypair, if any
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }

    /// Mark the store not ready (the backing secret disappeared)
    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// True iff a keypair is installed and no delete has fired since
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }
}

/// Watches the serving Secret and keeps the [`CertStore`] current.
///
/// Runs on every replica; only the elected leader writes the secret, so all
/// providers converge through informer events.
pub struct CertProvider {
    client: Client,
    namespace: String,
    secret_name: String,
    store: Arc<CertStore>,
}

impl CertProvider {
    /// Create a provider watching `secret_name` in `namespace`
    pub fn new(client: Client, namespace: &str, secret_name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            secret_name: secret_name.to_string(),
            store: Arc::new(CertStore::default()),
        }
    }

    /// Handle to the store backing the TLS listener
    pub fn store(&self) -> Arc<CertStore> {
        Arc::clone(&self.store)
    }

    /// Whether a serving keypair is currently installed
    pub fn ready(&self) -> bool {
        self.store.ready()
    }

    /// Watch the serving secret until the token is cancelled.
    ///
    /// Performs an initial direct load (failures are warnings - the secret
    /// may not be created yet), then follows watch events with backoff.
    pub async fn start(&self, shutdown: CancellationToken) {
        if let Err(e) = self.load_once().await {
            warn!(
                secret = %self.secret_name,
                error = %e,
                "Initial certificate load failed, will retry via watch"
            );
        }

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.secret_name));
        let stream = watcher(api, config).default_backoff();
        let mut stream = std::pin::pin!(stream);

        info!(
            namespace = %self.namespace,
            secret = %self.secret_name,
            "Certificate provider watching serving secret"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Certificate provider stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Apply(secret)))
                    | Some(Ok(watcher::Event::InitApply(secret))) => {
                        self.on_secret_update(&secret);
                    }
                    Some(Ok(watcher::Event::Delete(_))) => {
                        warn!(
                            namespace = %self.namespace,
                            secret = %self.secret_name,
                            "Serving secret deleted, marking not ready"
                        );
                        self.store.mark_not_ready();
                    }
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Serving secret watch error, backing off");
                    }
                    None => {
                        warn!("Serving secret watch stream ended");
                        return;
                    }
                }
            }
        }
    }

    async fn load_once(&self) -> kube::Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(&self.secret_name).await {
            Ok(secret) => {
                self.on_secret_update(&secret);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(
                    namespace = %self.namespace,
                    secret = %self.secret_name,
                    "Serving secret not found yet"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn on_secret_update(&self, secret: &Secret) {
        let Some(data) = &secret.data else {
            debug!(secret = %self.secret_name, "Serving secret has no data yet");
            return;
        };
        let (Some(cert), Some(key)) = (data.get(TLS_CERT_KEY), data.get(TLS_KEY_KEY)) else {
            debug!(secret = %self.secret_name, "Serving secret has no TLS material yet");
            return;
        };
        if cert.0.is_empty() || key.0.is_empty() {
            debug!(secret = %self.secret_name, "Serving secret TLS material is empty");
            return;
        }

        match self.store.install(&cert.0, &key.0) {
            Ok(leaf) => {
                metrics::update_certificate_metrics(
                    metrics::KIND_SERVING,
                    leaf.not_before(),
                    leaf.not_after(),
                );
                info!(
                    namespace = %self.namespace,
                    secret = %self.secret_name,
                    not_after = %leaf.not_after(),
                    "Serving certificate reloaded"
                );
            }
            Err(e) => {
                error!(
                    namespace = %self.namespace,
                    secret = %self.secret_name,
                    error = %e,
                    "Failed to parse serving certificate, keeping previous keypair"
                );
            }
        }
    }
}
