//! Certificate expiry gauges
//!
//! The metric set is process-wide and registered once into a lazily created
//! registry. Components that want an isolated registry (tests, embedders)
//! can register a fresh [`CertificateMetrics`] into their own
//! [`Registry`] instead of going through the globals.

use std::sync::atomic::AtomicU64;
use std::sync::LazyLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use time::OffsetDateTime;

/// Label value for CA certificates
pub const KIND_CA: &str = "ca";
/// Label value for serving certificates
pub const KIND_SERVING: &str = "serving";

/// Labels attached to every certificate gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CertificateLabels {
    /// Certificate kind: "ca" or "serving"
    pub kind: String,
}

type TimestampGauge = Family<CertificateLabels, Gauge<f64, AtomicU64>>;

/// Gauges describing the validity window of the managed certificates
#[derive(Clone, Default)]
pub struct CertificateMetrics {
    expiry: TimestampGauge,
    not_before: TimestampGauge,
    valid_duration: TimestampGauge,
}

impl CertificateMetrics {
    /// Register all gauges into the given registry
    pub fn register_into(&self, registry: &mut Registry) {
        registry.register(
            "admission_webhook_certificate_expiry_timestamp_seconds",
            "Expiry timestamp of the certificate in seconds since epoch",
            self.expiry.clone(),
        );
        registry.register(
            "admission_webhook_certificate_not_before_timestamp_seconds",
            "Not-before timestamp of the certificate in seconds since epoch",
            self.not_before.clone(),
        );
        registry.register(
            "admission_webhook_certificate_valid_duration_seconds",
            "Total valid duration of the certificate in seconds",
            self.valid_duration.clone(),
        );
    }

    /// Record the validity window of a certificate
    pub fn observe(&self, kind: &str, not_before: OffsetDateTime, not_after: OffsetDateTime) {
        let labels = CertificateLabels {
            kind: kind.to_string(),
        };
        self.expiry
            .get_or_create(&labels)
            .set(not_after.unix_timestamp() as f64);
        self.not_before
            .get_or_create(&labels)
            .set(not_before.unix_timestamp() as f64);
        self.valid_duration
            .get_or_create(&labels)
            .set((not_after - not_before).as_seconds_f64());
    }
}

static METRICS: LazyLock<CertificateMetrics> = LazyLock::new(CertificateMetrics::default);

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let mut registry = Registry::default();
    METRICS.register_into(&mut registry);
    registry
});

/// The process-wide certificate metrics
pub fn certificate_metrics() -> &'static CertificateMetrics {
    &METRICS
}

/// The process-wide metrics registry
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Update the process-wide gauges for a certificate
pub fn update_certificate_metrics(
    kind: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) {
    // Touch the registry so registration happens before first exposition.
    LazyLock::force(&REGISTRY);
    METRICS.observe(kind, not_before, not_after);
}

/// Encode the process-wide registry in OpenMetrics text format
pub fn encode_metrics() -> Result<String, std::fmt::Error> {
    let mut buf = String::new();
    encode(&mut buf, registry())?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_and_encode_scoped_registry() {
        let metrics = CertificateMetrics::default();
        let mut registry = Registry::default();
        metrics.register_into(&mut registry);

        let now = OffsetDateTime::now_utc();
        metrics.observe(KIND_SERVING, now, now + time::Duration::hours(24));

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("admission_webhook_certificate_expiry_timestamp_seconds"));
        assert!(buf.contains("kind=\"serving\""));
        assert!(buf.contains("admission_webhook_certificate_valid_duration_seconds"));
        assert!(buf.contains("86400"));
    }

    #[test]
    fn global_registry_exposes_updates() {
        let now = OffsetDateTime::now_utc();
        update_certificate_metrics(KIND_CA, now, now + time::Duration::hours(48));
        let text = encode_metrics().unwrap();
        assert!(text.contains("kind=\"ca\""));
    }
}
