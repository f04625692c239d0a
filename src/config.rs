//! Configuration record, environment overlay, and startup validation
//!
//! Configuration priority is `code > environment > default`: the resolver
//! starts from built-in defaults, applies `ACW_*` environment variables, and
//! keeps explicit values from the user's [`Config`] wherever the field is
//! non-zero. The merge is typed per field; there is no reflective walk.
//!
//! Resolution happens once at startup. Every validation failure is a
//! descriptive [`Error::Config`] and the process never starts.

use std::time::Duration;

use crate::error::Error;

/// Environment variable prefix for all configuration
pub const ENV_PREFIX: &str = "ACW";

/// Namespace file auto-mounted by Kubernetes in pods with a ServiceAccount
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace used when detection finds nothing
pub const DEFAULT_NAMESPACE: &str = "default";
/// Default webhook HTTPS port
pub const DEFAULT_PORT: u16 = 8443;
/// Default metrics HTTP port
pub const DEFAULT_METRICS_PORT: u16 = 8080;
/// Default metrics path
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
/// Default health check path
pub const DEFAULT_HEALTHZ_PATH: &str = "/healthz";
/// Default readiness check path
pub const DEFAULT_READYZ_PATH: &str = "/readyz";
/// Default CA certificate validity
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(48 * 3600);
/// Default CA refresh window
pub const DEFAULT_CA_REFRESH: Duration = Duration::from_secs(24 * 3600);
/// Default serving certificate validity
pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(24 * 3600);
/// Default serving certificate refresh window
pub const DEFAULT_CERT_REFRESH: Duration = Duration::from_secs(12 * 3600);
/// Default leader election lease duration
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
/// Default leader election renew deadline
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Default leader election retry period
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// User-facing configuration for the webhook server.
///
/// Zero values (`""`, `0`, `Duration::ZERO`, `None`) mean "unset" and are
/// filled from the environment or defaults during resolution. Env variables
/// use the `ACW_` prefix: `ACW_NAME`, `ACW_NAMESPACE`, `ACW_PORT`,
/// `ACW_CA_VALIDITY` (duration strings like `48h`), and so on.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Webhook name, used as the prefix for Secret, ConfigMap, and Lease
    /// names and as the webhook configuration name. Required.
    pub name: String,

    /// Namespace where the webhook is deployed. Auto-detected when empty.
    pub namespace: String,

    /// Name of the Kubernetes Service for the webhook. Defaults to `name`.
    pub service_name: String,

    /// Port the webhook HTTPS server listens on. Default 8443.
    pub port: u16,

    /// Whether to expose the metrics server. Default true.
    pub metrics_enabled: Option<bool>,

    /// Port for the plain-HTTP metrics server. Default 8080.
    pub metrics_port: u16,

    /// Path for the metrics endpoint. Default `/metrics`.
    pub metrics_path: String,

    /// Path for the health check endpoint. Default `/healthz`.
    pub healthz_path: String,

    /// Path for the readiness check endpoint. Default `/readyz`.
    pub readyz_path: String,

    /// Name of the Secret holding the CA keypair. Default `<name>-ca`.
    pub ca_secret_name: String,

    /// Name of the Secret holding the serving keypair. Default `<name>-cert`.
    pub cert_secret_name: String,

    /// Name of the ConfigMap holding the CA bundle. Default `<name>-ca-bundle`.
    pub ca_bundle_configmap_name: String,

    /// Validity of the CA certificate. Default 48h.
    pub ca_validity: Duration,

    /// Refresh window of the CA certificate. Default 24h.
    pub ca_refresh: Duration,

    /// Validity of the serving certificate. Default 24h.
    pub cert_validity: Duration,

    /// Refresh window of the serving certificate. Default 12h.
    pub cert_refresh: Duration,

    /// Whether to run leader election. Default true.
    pub leader_election: Option<bool>,

    /// Name of the leader election Lease. Default `<name>-leader`.
    pub leader_election_id: String,

    /// Duration of the leader election lease. Default 30s.
    pub lease_duration: Duration,

    /// Deadline for renewing the lease before demotion. Default 10s.
    pub renew_deadline: Duration,

    /// Period between lease acquisition attempts. Default 5s.
    pub retry_period: Duration,
}

/// Fully resolved and validated configuration
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    /// Webhook name
    pub name: String,
    /// Namespace where certificates and the lease live
    pub namespace: String,
    /// Kubernetes Service name covered by the serving certificate SANs
    pub service_name: String,
    /// Webhook HTTPS port
    pub port: u16,
    /// Whether the metrics server runs
    pub metrics_enabled: bool,
    /// Metrics HTTP port
    pub metrics_port: u16,
    /// Metrics path
    pub metrics_path: String,
    /// Health check path
    pub healthz_path: String,
    /// Readiness check path
    pub readyz_path: String,
    /// CA Secret name
    pub ca_secret_name: String,
    /// Serving Secret name
    pub cert_secret_name: String,
    /// CA bundle ConfigMap name
    pub ca_bundle_configmap_name: String,
    /// CA certificate validity
    pub ca_validity: Duration,
    /// CA refresh window
    pub ca_refresh: Duration,
    /// Serving certificate validity
    pub cert_validity: Duration,
    /// Serving certificate refresh window
    pub cert_refresh: Duration,
    /// Whether leader election gates the certificate writers
    pub leader_election: bool,
    /// Leader election Lease name
    pub leader_election_id: String,
    /// Lease duration
    pub lease_duration: Duration,
    /// Renew deadline
    pub renew_deadline: Duration,
    /// Retry period
    pub retry_period: Duration,
}

impl ResolvedConfig {
    /// The hostnames the serving certificate must cover
    pub fn serving_hostnames(&self) -> Vec<String> {
        vec![
            self.service_name.clone(),
            format!("{}.{}", self.service_name, self.namespace),
            format!("{}.{}.svc", self.service_name, self.namespace),
        ]
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::config(
                "webhook name is required in Configure() or the ACW_NAME environment variable",
            ));
        }
        for (label, d) in [
            ("CA validity", self.ca_validity),
            ("CA refresh", self.ca_refresh),
            ("cert validity", self.cert_validity),
            ("cert refresh", self.cert_refresh),
        ] {
            if d.is_zero() {
                return Err(Error::config(format!("{} must be positive", label)));
            }
        }
        if self.ca_refresh >= self.ca_validity {
            return Err(Error::config(format!(
                "CA refresh ({:?}) must be less than CA validity ({:?})",
                self.ca_refresh, self.ca_validity
            )));
        }
        if self.cert_refresh >= self.cert_validity {
            return Err(Error::config(format!(
                "cert refresh ({:?}) must be less than cert validity ({:?})",
                self.cert_refresh, self.cert_validity
            )));
        }
        if self.leader_election {
            if !(self.retry_period < self.renew_deadline
                && self.renew_deadline < self.lease_duration)
            {
                return Err(Error::config(format!(
                    "leader election timings must satisfy retry period ({:?}) < renew deadline ({:?}) < lease duration ({:?})",
                    self.retry_period, self.renew_deadline, self.lease_duration
                )));
            }
        }
        for (label, path) in [
            ("healthz path", &self.healthz_path),
            ("readyz path", &self.readyz_path),
            ("metrics path", &self.metrics_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::config(format!(
                    "{} must start with '/': {:?}",
                    label, path
                )));
            }
        }
        Ok(())
    }
}

/// Resolve the user configuration against the process environment
pub fn resolve(config: Config) -> Result<ResolvedConfig, Error> {
    resolve_with(config, &env_lookup, read_service_account_namespace)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, key))
        .ok()
        .filter(|v| !v.is_empty())
}

fn read_service_account_namespace() -> Option<String> {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve with injected environment and namespace-file lookups.
///
/// Split out from [`resolve`] so precedence rules are testable without
/// mutating process state.
fn resolve_with(
    config: Config,
    lookup: &dyn Fn(&str) -> Option<String>,
    namespace_file: impl FnOnce() -> Option<String>,
) -> Result<ResolvedConfig, Error> {
    let name = pick_string(config.name, lookup("NAME"), String::new());

    let namespace = match pick_string(config.namespace, lookup("NAMESPACE"), String::new()) {
        ns if !ns.is_empty() => ns,
        _ => detect_namespace(namespace_file),
    };

    let resolved = ResolvedConfig {
        service_name: pick_string(config.service_name, lookup("SERVICE_NAME"), name.clone()),
        port: pick_u16(config.port, lookup("PORT"), DEFAULT_PORT)?,
        metrics_enabled: pick_bool(config.metrics_enabled, lookup("METRICS_ENABLED"), true)?,
        metrics_port: pick_u16(config.metrics_port, lookup("METRICS_PORT"), DEFAULT_METRICS_PORT)?,
        metrics_path: pick_string(
            config.metrics_path,
            lookup("METRICS_PATH"),
            DEFAULT_METRICS_PATH.to_string(),
        ),
        healthz_path: pick_string(
            config.healthz_path,
            lookup("HEALTHZ_PATH"),
            DEFAULT_HEALTHZ_PATH.to_string(),
        ),
        readyz_path: pick_string(
            config.readyz_path,
            lookup("READYZ_PATH"),
            DEFAULT_READYZ_PATH.to_string(),
        ),
        ca_secret_name: pick_string(
            config.ca_secret_name,
            lookup("CA_SECRET_NAME"),
            format!("{}-ca", name),
        ),
        cert_secret_name: pick_string(
            config.cert_secret_name,
            lookup("CERT_SECRET_NAME"),
            format!("{}-cert", name),
        ),
        ca_bundle_configmap_name: pick_string(
            config.ca_bundle_configmap_name,
            lookup("CA_BUNDLE_CONFIGMAP_NAME"),
            format!("{}-ca-bundle", name),
        ),
        ca_validity: pick_duration(config.ca_validity, lookup("CA_VALIDITY"), DEFAULT_CA_VALIDITY)?,
        ca_refresh: pick_duration(config.ca_refresh, lookup("CA_REFRESH"), DEFAULT_CA_REFRESH)?,
        cert_validity: pick_duration(
            config.cert_validity,
            lookup("CERT_VALIDITY"),
            DEFAULT_CERT_VALIDITY,
        )?,
        cert_refresh: pick_duration(
            config.cert_refresh,
            lookup("CERT_REFRESH"),
            DEFAULT_CERT_REFRESH,
        )?,
        leader_election: pick_bool(config.leader_election, lookup("LEADER_ELECTION"), true)?,
        leader_election_id: pick_string(
            config.leader_election_id,
            lookup("LEADER_ELECTION_ID"),
            format!("{}-leader", name),
        ),
        lease_duration: pick_duration(
            config.lease_duration,
            lookup("LEASE_DURATION"),
            DEFAULT_LEASE_DURATION,
        )?,
        renew_deadline: pick_duration(
            config.renew_deadline,
            lookup("RENEW_DEADLINE"),
            DEFAULT_RENEW_DEADLINE,
        )?,
        retry_period: pick_duration(
            config.retry_period,
            lookup("RETRY_PERIOD"),
            DEFAULT_RETRY_PERIOD,
        )?,
        name,
        namespace,
    };

    resolved.validate()?;
    Ok(resolved)
}

/// Namespace detection order after explicit config and `ACW_NAMESPACE`:
/// `POD_NAMESPACE`, then the ServiceAccount namespace file, then "default".
fn detect_namespace(namespace_file: impl FnOnce() -> Option<String>) -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Some(ns) = namespace_file() {
        return ns;
    }
    DEFAULT_NAMESPACE.to_string()
}

/// Identity for leader election: `POD_NAME`, then hostname, then "unknown"
pub fn leader_identity() -> String {
    for key in ["POD_NAME", "HOSTNAME"] {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    "unknown".to_string()
}

fn pick_string(code: String, env: Option<String>, default: String) -> String {
    if !code.is_empty() {
        code
    } else if let Some(v) = env {
        v
    } else {
        default
    }
}

fn pick_u16(code: u16, env: Option<String>, default: u16) -> Result<u16, Error> {
    if code != 0 {
        return Ok(code);
    }
    match env {
        Some(v) => v
            .parse()
            .map_err(|_| Error::config(format!("invalid port value: {:?}", v))),
        None => Ok(default),
    }
}

fn pick_bool(code: Option<bool>, env: Option<String>, default: bool) -> Result<bool, Error> {
    if let Some(b) = code {
        return Ok(b);
    }
    match env.as_deref() {
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(Error::config(format!(
            "invalid boolean value: {:?} (expected true/false)",
            other
        ))),
        None => Ok(default),
    }
}

fn pick_duration(code: Duration, env: Option<String>, default: Duration) -> Result<Duration, Error> {
    if !code.is_zero() {
        return Ok(code);
    }
    match env {
        Some(v) => parse_duration(&v),
        None => Ok(default),
    }
}

/// Parse a duration string like `48h`, `90s`, or `1h30m`.
///
/// Units: `ms`, `s`, `m`, `h`, `d`. Segments may be chained.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let err = || Error::config(format!("invalid duration: {:?} (expected e.g. 48h, 1h30m)", input));

    let mut total = Duration::ZERO;
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(err());
    }

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(err)?;
        if digits_end == 0 {
            return Err(err());
        }
        let value: u64 = rest[..digits_end].parse().map_err(|_| err())?;
        rest = &rest[digits_end..];

        let (unit_len, unit) = if rest.starts_with("ms") {
            (2, Duration::from_millis(1))
        } else if rest.starts_with('s') {
            (1, Duration::from_secs(1))
        } else if rest.starts_with('m') {
            (1, Duration::from_secs(60))
        } else if rest.starts_with('h') {
            (1, Duration::from_secs(3600))
        } else if rest.starts_with('d') {
            (1, Duration::from_secs(86400))
        } else {
            return Err(err());
        };
        rest = &rest[unit_len..];
        total += unit * u32::try_from(value).map_err(|_| err())?;
    }

    Ok(total)
}
