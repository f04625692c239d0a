//! Leader-only certificate reconcile loop
//!
//! The [`CertManager`] owns the authoritative state of the CA Secret, the
//! CA-bundle ConfigMap, and the serving Secret. Each tick reads current
//! state and moves it toward the goal; a converged state produces zero
//! writes, so the loop is idempotent by construction.
//!
//! A tick performs three steps strictly in order - CA, bundle, serving - so
//! a serving certificate is never signed by a CA that is absent from the
//! bundle. If the bundle step fails, the serving step is skipped and the
//! next tick retries.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedConfig;
use crate::error::Error;
use crate::metrics;
use crate::pki::{self, ParsedCertificate, SigningAuthority};

/// Interval between reconcile ticks
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Key of the concatenated-PEM bundle inside the CA-bundle ConfigMap
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Annotation recording which signer secret feeds the bundle, so multiple
/// installations can share a namespace without fighting over ConfigMaps.
const SIGNER_NAME_ANNOTATION: &str = "autocert-webhook.dev/signer-name";

const REPORTING_CONTROLLER: &str = "autocert-webhook-cert-manager";

/// Configuration for the certificate manager
#[derive(Clone, Debug)]
pub struct CertManagerConfig {
    /// Namespace where certificates are stored
    pub namespace: String,
    /// Service name covered by the serving certificate SANs
    pub service_name: String,
    /// Name of the CA secret
    pub ca_secret_name: String,
    /// Name of the serving certificate secret
    pub cert_secret_name: String,
    /// Name of the CA bundle configmap
    pub ca_bundle_configmap_name: String,
    /// Validity of the CA certificate
    pub ca_validity: Duration,
    /// Refresh window of the CA certificate
    pub ca_refresh: Duration,
    /// Validity of the serving certificate
    pub cert_validity: Duration,
    /// Refresh window of the serving certificate
    pub cert_refresh: Duration,
}

impl CertManagerConfig {
    /// Extract the manager's slice of a resolved configuration
    pub fn from_resolved(cfg: &ResolvedConfig) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            service_name: cfg.service_name.clone(),
            ca_secret_name: cfg.ca_secret_name.clone(),
            cert_secret_name: cfg.cert_secret_name.clone(),
            ca_bundle_configmap_name: cfg.ca_bundle_configmap_name.clone(),
            ca_validity: cfg.ca_validity,
            ca_refresh: cfg.ca_refresh,
            cert_validity: cfg.cert_validity,
            cert_refresh: cfg.cert_refresh,
        }
    }
}

/// Why a serving certificate must be re-issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RotationReason {
    /// No usable material in the secret
    Missing,
    /// Current time is outside the validity window
    Expired,
    /// Inside the refresh window
    DueForRefresh,
    /// Signed by a CA that is not in the bundle
    UntrustedSigner,
    /// SANs no longer cover the expected hostnames
    HostnamesChanged,
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationReason::Missing => "no usable certificate",
            RotationReason::Expired => "certificate expired",
            RotationReason::DueForRefresh => "entered refresh window",
            RotationReason::UntrustedSigner => "signer not in CA bundle",
            RotationReason::HostnamesChanged => "SANs do not cover service hostnames",
        };
        f.write_str(s)
    }
}

/// The certificate reconcile loop, run on the elected leader only
pub struct CertManager {
    config: CertManagerConfig,
    secrets: Api<Secret>,
    configmaps: Api<ConfigMap>,
    recorder: Recorder,
}

impl CertManager {
    /// Create a new certificate manager
    pub fn new(client: Client, config: CertManagerConfig) -> Self {
        let secrets = Api::namespaced(client.clone(), &config.namespace);
        let configmaps = Api::namespaced(client.clone(), &config.namespace);
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client, reporter);
        Self {
            config,
            secrets,
            configmaps,
            recorder,
        }
    }

    /// Reconcile immediately, then every [`SYNC_INTERVAL`], until cancelled.
    ///
    /// A failed tick is logged and surfaced as a Warning event; the loop
    /// never aborts on reconcile errors.
    pub async fn start(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            namespace = %self.config.namespace,
            ca_secret = %self.config.ca_secret_name,
            cert_secret = %self.config.cert_secret_name,
            "Certificate manager started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Certificate manager stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        error!(error = %e, "Certificate sync failed");
                        self.publish_event(
                            EventType::Warning,
                            "CertificateSyncFailed",
                            e.to_string(),
                            self.secret_ref(&self.config.ca_secret_name),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// One reconcile tick: CA, then bundle, then serving certificate
    async fn sync(&self) -> Result<(), Error> {
        debug!("Syncing certificates");
        let signer = self.ensure_ca().await?;
        let bundle = self.ensure_ca_bundle(&signer).await?;
        self.ensure_serving_cert(&signer, &bundle).await?;
        debug!("Certificate sync completed");
        Ok(())
    }

    /// Ensure the CA secret holds a usable signer, minting one if needed
    async fn ensure_ca(&self) -> Result<SigningAuthority, Error> {
        let secret = self.get_or_create_secret(&self.config.ca_secret_name).await?;
        let now = OffsetDateTime::now_utc();

        if let Some(authority) = parse_signer(&secret, self.config.ca_refresh, now) {
            metrics::update_certificate_metrics(
                metrics::KIND_CA,
                authority.cert().not_before(),
                authority.cert().not_after(),
            );
            return Ok(authority);
        }

        let signer_name = format!("{}/{}", self.config.namespace, self.config.ca_secret_name);
        let common_name = format!("{}@{}", signer_name, now.unix_timestamp());
        let authority = SigningAuthority::mint(&common_name, self.config.ca_validity)?;

        let mut updated = secret;
        set_tls_data(&mut updated, authority.cert_pem(), authority.key_pem());
        self.secrets
            .replace(
                &self.config.ca_secret_name,
                &PostParams::default(),
                &updated,
            )
            .await?;

        info!(
            secret = %self.config.ca_secret_name,
            subject = %authority.cert().subject(),
            not_after = %authority.cert().not_after(),
            "Signer rotated"
        );
        self.publish_event(
            EventType::Normal,
            "SignerRotated",
            format!("minted signer valid until {}", authority.cert().not_after()),
            self.secret_ref(&self.config.ca_secret_name),
        )
        .await;
        metrics::update_certificate_metrics(
            metrics::KIND_CA,
            authority.cert().not_before(),
            authority.cert().not_after(),
        );
        Ok(authority)
    }

    /// Ensure the bundle ConfigMap holds the signer plus every previously
    /// published, still-unexpired CA
    async fn ensure_ca_bundle(
        &self,
        signer: &SigningAuthority,
    ) -> Result<Vec<ParsedCertificate>, Error> {
        let name = &self.config.ca_bundle_configmap_name;
        let now = OffsetDateTime::now_utc();

        let existing = match self.configmaps.get(name).await {
            Ok(cm) => Some(cm),
            Err(kube::Error::Api(ae)) if ae.code == 404 => None,
            Err(e) => return Err(e.into()),
        };
        let existing_pem = existing
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|d| d.get(CA_BUNDLE_KEY))
            .cloned()
            .unwrap_or_default();

        let bundle = build_bundle(signer.cert(), &pki::parse_bundle(&existing_pem), now);
        let bundle_pem = pki::serialize_bundle(&bundle);
        let signer_name = format!("{}/{}", self.config.namespace, self.config.ca_secret_name);

        match existing {
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        annotations: Some(BTreeMap::from([(
                            SIGNER_NAME_ANNOTATION.to_string(),
                            signer_name,
                        )])),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(
                        CA_BUNDLE_KEY.to_string(),
                        bundle_pem,
                    )])),
                    ..Default::default()
                };
                self.configmaps.create(&PostParams::default(), &cm).await?;
                info!(configmap = %name, certs = bundle.len(), "CA bundle created");
                self.publish_event(
                    EventType::Normal,
                    "CABundleUpdated",
                    format!("bundle now holds {} certificate(s)", bundle.len()),
                    self.configmap_ref(name),
                )
                .await;
            }
            Some(cm) if cm.data.as_ref().and_then(|d| d.get(CA_BUNDLE_KEY)) != Some(&bundle_pem) => {
                let mut updated = cm;
                updated
                    .metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(SIGNER_NAME_ANNOTATION.to_string(), signer_name);
                updated
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CA_BUNDLE_KEY.to_string(), bundle_pem);
                self.configmaps
                    .replace(name, &PostParams::default(), &updated)
                    .await?;
                info!(configmap = %name, certs = bundle.len(), "CA bundle updated");
                self.publish_event(
                    EventType::Normal,
                    "CABundleUpdated",
                    format!("bundle now holds {} certificate(s)", bundle.len()),
                    self.configmap_ref(name),
                )
                .await;
            }
            Some(_) => {}
        }

        Ok(bundle)
    }

    /// Ensure the serving secret holds a fresh leaf signed by the current CA
    async fn ensure_serving_cert(
        &self,
        signer: &SigningAuthority,
        bundle: &[ParsedCertificate],
    ) -> Result<(), Error> {
        let secret = self
            .get_or_create_secret(&self.config.cert_secret_name)
            .await?;
        let now = OffsetDateTime::now_utc();
        let hostnames = self.hostnames();

        let leaf = parse_serving_leaf(&secret);
        let Some(reason) =
            rotation_reason(leaf.as_ref(), bundle, &hostnames, self.config.cert_refresh, now)
        else {
            return Ok(());
        };

        info!(
            secret = %self.config.cert_secret_name,
            reason = %reason,
            "Rotating serving certificate"
        );
        let (cert_pem, key_pem) = signer.issue_serving(&hostnames, self.config.cert_validity)?;

        let mut updated = secret;
        set_tls_data(&mut updated, &cert_pem, &key_pem);
        self.secrets
            .replace(
                &self.config.cert_secret_name,
                &PostParams::default(),
                &updated,
            )
            .await?;

        self.publish_event(
            EventType::Normal,
            "ServingCertRotated",
            format!("re-issued serving certificate: {}", reason),
            self.secret_ref(&self.config.cert_secret_name),
        )
        .await;
        Ok(())
    }

    /// Get a secret, creating an empty tls-typed one if it does not exist
    async fn get_or_create_secret(&self, name: &str) -> Result<Secret, Error> {
        match self.secrets.get(name).await {
            Ok(s) => Ok(s),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let secret = empty_tls_secret(name, &self.config.namespace);
                match self.secrets.create(&PostParams::default(), &secret).await {
                    Ok(s) => {
                        info!(secret = %name, "Created empty TLS secret");
                        Ok(s)
                    }
                    // Lost a create race; read back whatever won.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        Ok(self.secrets.get(name).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn hostnames(&self) -> Vec<String> {
        vec![
            self.config.service_name.clone(),
            format!("{}.{}", self.config.service_name, self.config.namespace),
            format!("{}.{}.svc", self.config.service_name, self.config.namespace),
        ]
    }

    fn secret_ref(&self, name: &str) -> ObjectReference {
        ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Secret".to_string()),
            name: Some(name.to_string()),
            namespace: Some(self.config.namespace.clone()),
            ..Default::default()
        }
    }

    fn configmap_ref(&self, name: &str) -> ObjectReference {
        ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("ConfigMap".to_string()),
            name: Some(name.to_string()),
            namespace: Some(self.config.namespace.clone()),
            ..Default::default()
        }
    }

    /// Fire-and-forget event publication; a failed event never breaks a tick
    async fn publish_event(
        &self,
        type_: EventType,
        reason: &str,
        note: String,
        reference: ObjectReference,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Parse the signer out of the CA secret if it is usable as-is.
///
/// Returns None when the material is absent, corrupt, not a CA, outside its
/// validity window, or inside the refresh window - every case the caller
/// answers by minting a fresh signer.
fn parse_signer(
    secret: &Secret,
    ca_refresh: Duration,
    now: OffsetDateTime,
) -> Option<SigningAuthority> {
    let (cert_pem, key_pem) = tls_data(secret)?;
    let authority = match SigningAuthority::from_pem(&cert_pem, &key_pem) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "Existing CA material unparseable, re-minting");
            return None;
        }
    };
    if !authority.cert().is_ca() {
        warn!("Existing CA certificate lacks the CA constraint, re-minting");
        return None;
    }
    if !authority.cert().is_valid_at(now) {
        return None;
    }
    if pki::due_for_rotation(authority.cert(), ca_refresh, now) {
        return None;
    }
    Some(authority)
}

/// Parse the serving leaf out of the secret, requiring a usable private key
fn parse_serving_leaf(secret: &Secret) -> Option<ParsedCertificate> {
    let (cert_pem, key_pem) = tls_data(secret)?;
    if rcgen::KeyPair::from_pem(&key_pem).is_err() {
        warn!("Existing serving key unparseable, re-issuing");
        return None;
    }
    match ParsedCertificate::from_pem(&cert_pem) {
        Ok(leaf) => Some(leaf),
        Err(e) => {
            warn!(error = %e, "Existing serving certificate unparseable, re-issuing");
            None
        }
    }
}

/// Decide whether the serving certificate must be re-issued, and why
fn rotation_reason(
    leaf: Option<&ParsedCertificate>,
    bundle: &[ParsedCertificate],
    hostnames: &[String],
    cert_refresh: Duration,
    now: OffsetDateTime,
) -> Option<RotationReason> {
    let Some(leaf) = leaf else {
        return Some(RotationReason::Missing);
    };
    if !leaf.is_valid_at(now) {
        return Some(RotationReason::Expired);
    }
    if pki::due_for_rotation(leaf, cert_refresh, now) {
        return Some(RotationReason::DueForRefresh);
    }
    if !bundle.iter().any(|ca| pki::is_signed_by(leaf, ca)) {
        return Some(RotationReason::UntrustedSigner);
    }
    if !pki::sans_cover(leaf, hostnames) {
        return Some(RotationReason::HostnamesChanged);
    }
    None
}

/// Target bundle: the signer plus every published, still-unexpired CA,
/// deduplicated by DER and ordered newest NotAfter first.
fn build_bundle(
    signer: &ParsedCertificate,
    published: &[ParsedCertificate],
    now: OffsetDateTime,
) -> Vec<ParsedCertificate> {
    let mut bundle: Vec<ParsedCertificate> = Vec::new();
    for cert in std::iter::once(signer).chain(published.iter()) {
        if cert.is_expired_at(now) {
            continue;
        }
        if bundle.iter().any(|c| c.der() == cert.der()) {
            continue;
        }
        bundle.push(cert.clone());
    }
    bundle.sort_by(|a, b| b.not_after().cmp(&a.not_after()));
    bundle
}

fn tls_data(secret: &Secret) -> Option<(String, String)> {
    let data = secret.data.as_ref()?;
    let cert = data.get(TLS_CERT_KEY)?;
    let key = data.get(TLS_KEY_KEY)?;
    if cert.0.is_empty() || key.0.is_empty() {
        return None;
    }
    Some((
        String::from_utf8(cert.0.clone()).ok()?,
        String::from_utf8(key.0.clone()).ok()?,
    ))
}

fn set_tls_data(secret: &mut Secret, cert_pem: &str, key_pem: &str) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(
        TLS_CERT_KEY.to_string(),
        ByteString(cert_pem.as_bytes().to_vec()),
    );
    data.insert(
        TLS_KEY_KEY.to_string(),
        ByteString(key_pem.as_bytes().to_vec()),
    );
}

fn empty_tls_secret(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(Vec::new())),
            (TLS_KEY_KEY.to_string(), ByteString(Vec::new())),
        ])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour() -> Duration {
        Duration::from_secs(3600)
    }

    fn hostnames() -> Vec<String> {
        vec![
            "acme".to_string(),
            "acme.default".to_string(),
            "acme.default.svc".to_string(),
        ]
    }

    fn secret_with(cert_pem: &str, key_pem: &str) -> Secret {
        let mut secret = empty_tls_secret("acme-ca", "default");
        set_tls_data(&mut secret, cert_pem, key_pem);
        secret
    }

    fn serving_leaf(ca: &SigningAuthority) -> ParsedCertificate {
        let (cert_pem, _) = ca.issue_serving(&hostnames(), hour()).unwrap();
        ParsedCertificate::from_pem(&cert_pem).unwrap()
    }

    #[test]
    fn empty_secret_has_no_signer() {
        let secret = empty_tls_secret("acme-ca", "default");
        let now = OffsetDateTime::now_utc();
        assert!(parse_signer(&secret, hour(), now).is_none());
    }

    #[test]
    fn fresh_signer_is_reused() {
        let ca = SigningAuthority::mint("fresh", Duration::from_secs(48 * 3600)).unwrap();
        let secret = secret_with(ca.cert_pem(), ca.key_pem());
        let now = OffsetDateTime::now_utc();

        let reused = parse_signer(&secret, Duration::from_secs(24 * 3600), now).unwrap();
        assert_eq!(reused.cert(), ca.cert());
    }

    #[test]
    fn signer_in_refresh_window_is_replaced() {
        let ca = SigningAuthority::mint("stale", hour()).unwrap();
        let secret = secret_with(ca.cert_pem(), ca.key_pem());
        // Refresh window as wide as the whole remaining validity.
        assert!(parse_signer(&secret, hour(), OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn corrupt_signer_material_is_replaced() {
        let secret = secret_with("not a cert", "not a key");
        assert!(parse_signer(&secret, hour(), OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn non_ca_certificate_is_not_a_signer() {
        let ca = SigningAuthority::mint("real-ca", hour()).unwrap();
        let (leaf_pem, leaf_key) = ca.issue_serving(&hostnames(), hour()).unwrap();
        let secret = secret_with(&leaf_pem, &leaf_key);
        assert!(parse_signer(&secret, Duration::from_secs(60), OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn rotation_needed_when_leaf_missing() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            rotation_reason(None, &[], &hostnames(), hour(), now),
            Some(RotationReason::Missing)
        );
    }

    #[test]
    fn rotation_needed_when_signer_left_bundle() {
        let old_ca = SigningAuthority::mint("old", Duration::from_secs(48 * 3600)).unwrap();
        let new_ca = SigningAuthority::mint("new", Duration::from_secs(48 * 3600)).unwrap();
        let leaf = serving_leaf(&old_ca);
        let now = OffsetDateTime::now_utc();
        let refresh = Duration::from_secs(60);

        // While the old CA remains in the bundle the leaf is fine.
        let both = vec![new_ca.cert().clone(), old_ca.cert().clone()];
        assert_eq!(rotation_reason(Some(&leaf), &both, &hostnames(), refresh, now), None);

        // Once only the new CA is trusted the leaf must rotate.
        let only_new = vec![new_ca.cert().clone()];
        assert_eq!(
            rotation_reason(Some(&leaf), &only_new, &hostnames(), refresh, now),
            Some(RotationReason::UntrustedSigner)
        );
    }

    #[test]
    fn rotation_needed_when_hostnames_change() {
        let ca = SigningAuthority::mint("ca", Duration::from_secs(48 * 3600)).unwrap();
        let leaf = serving_leaf(&ca);
        let now = OffsetDateTime::now_utc();
        let bundle = vec![ca.cert().clone()];

        let mut moved = hostnames();
        moved[1] = "acme.other-namespace".to_string();
        assert_eq!(
            rotation_reason(Some(&leaf), &bundle, &moved, Duration::from_secs(60), now),
            Some(RotationReason::HostnamesChanged)
        );
    }

    #[test]
    fn rotation_needed_inside_refresh_window() {
        let ca = SigningAuthority::mint("ca", Duration::from_secs(48 * 3600)).unwrap();
        let leaf = serving_leaf(&ca);
        let bundle = vec![ca.cert().clone()];
        // Window wider than remaining validity: always due.
        assert_eq!(
            rotation_reason(
                Some(&leaf),
                &bundle,
                &hostnames(),
                Duration::from_secs(2 * 3600),
                OffsetDateTime::now_utc()
            ),
            Some(RotationReason::DueForRefresh)
        );
    }

    #[test]
    fn converged_leaf_needs_no_rotation() {
        let ca = SigningAuthority::mint("ca", Duration::from_secs(48 * 3600)).unwrap();
        let leaf = serving_leaf(&ca);
        let bundle = vec![ca.cert().clone()];
        assert_eq!(
            rotation_reason(
                Some(&leaf),
                &bundle,
                &hostnames(),
                Duration::from_secs(60),
                OffsetDateTime::now_utc()
            ),
            None
        );
    }

    #[test]
    fn bundle_keeps_old_ca_until_expiry() {
        let now = OffsetDateTime::now_utc();
        let old = SigningAuthority::mint("old", hour()).unwrap();
        let new = SigningAuthority::mint("new", Duration::from_secs(3 * 3600)).unwrap();

        let bundle = build_bundle(new.cert(), &[old.cert().clone()], now);
        assert_eq!(bundle.len(), 2);
        // Newest NotAfter first.
        assert_eq!(bundle[0], *new.cert());
        assert_eq!(bundle[1], *old.cert());
    }

    #[test]
    fn bundle_drops_expired_cas() {
        let now = OffsetDateTime::now_utc();
        let old = SigningAuthority::mint("old", hour()).unwrap();
        let new = SigningAuthority::mint("new", Duration::from_secs(3 * 3600)).unwrap();

        let later = now + time::Duration::hours(2);
        let bundle = build_bundle(new.cert(), &[old.cert().clone()], later);
        assert_eq!(bundle, vec![new.cert().clone()]);
    }

    #[test]
    fn bundle_deduplicates_the_signer() {
        let now = OffsetDateTime::now_utc();
        let ca = SigningAuthority::mint("ca", hour()).unwrap();

        let bundle = build_bundle(ca.cert(), &[ca.cert().clone()], now);
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn bundle_is_stable_across_rebuilds() {
        let now = OffsetDateTime::now_utc();
        let a = SigningAuthority::mint("a", hour()).unwrap();
        let b = SigningAuthority::mint("b", Duration::from_secs(2 * 3600)).unwrap();

        let first = build_bundle(b.cert(), &[a.cert().clone()], now);
        let published = pki::parse_bundle(&pki::serialize_bundle(&first));
        let second = build_bundle(b.cert(), &published, now);
        assert_eq!(first, second);
        assert_eq!(pki::serialize_bundle(&first), pki::serialize_bundle(&second));
    }

    #[test]
    fn tls_data_round_trip() {
        let mut secret = empty_tls_secret("s", "ns");
        assert!(tls_data(&secret).is_none());

        set_tls_data(&mut secret, "CERT", "KEY");
        let (c, k) = tls_data(&secret).unwrap();
        assert_eq!(c, "CERT");
        assert_eq!(k, "KEY");
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
    }
}
